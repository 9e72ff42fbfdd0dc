//! Process group over a TCP star rooted at rank 0.

use std::{
    collections::BTreeMap,
    io::ErrorKind,
    net::{TcpListener, TcpStream},
    sync::Mutex,
    thread,
    time::Duration,
};

use tracing::{debug, info};

pub mod replicator;
pub(crate) mod wire;

pub use replicator::ReplicatedModel;

use crate::TrainingError;
use wire::{
    read_frame, write_frame, Frame, TAG_GOODBYE, TAG_GRADIENTS, TAG_PARAMETERS, TAG_REJECT,
    TAG_WELCOME,
};

const CONNECT_RETRY: Duration = Duration::from_millis(50);

#[derive(Debug)]
enum Links {
    /// Streams to ranks `1..world_size`, in rank order. The listener stays
    /// bound until teardown so the endpoint belongs to one run at a time.
    Root {
        listener: TcpListener,
        peers: Vec<TcpStream>,
    },
    Peer { root: TcpStream },
}

#[derive(Debug)]
pub struct ProcessGroup {
    rank: usize,
    world_size: usize,
    links: Mutex<Links>,
}

impl ProcessGroup {
    /// Joins the rendezvous at `addr`. Blocks until every rank has arrived.
    ///
    /// Peers keep retrying while the root is not listening yet; any other
    /// failure, including the address already being bound, is fatal.
    pub fn setup(rank: usize, world_size: usize, addr: &str) -> Result<Self, TrainingError> {
        if world_size == 0 || rank >= world_size {
            return Err(TrainingError::rendezvous(format!(
                "rank {rank} is outside a world of size {world_size}"
            )));
        }

        let links = if rank == 0 {
            let listener = TcpListener::bind(addr)
                .map_err(|err| TrainingError::rendezvous(format!("failed to bind {addr}: {err}")))?;
            let peers = accept_peers(&listener, world_size, addr)?;
            Links::Root { listener, peers }
        } else {
            Links::Peer {
                root: join_root(rank, world_size, addr)?,
            }
        };

        info!(rank, world_size, addr, "joined process group");
        Ok(Self {
            rank,
            world_size,
            links: Mutex::new(links),
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Replaces `buffer` on every rank with the element-wise mean across ranks.
    ///
    /// Rank 0 sums contributions in rank order and broadcasts the result, so
    /// every rank ends up with the same bits.
    pub fn all_reduce_mean(&self, buffer: &mut [f32]) -> Result<(), TrainingError> {
        let mut links = self
            .links
            .lock()
            .map_err(|_| TrainingError::runtime("process group lock poisoned"))?;

        match &mut *links {
            Links::Root { peers, .. } => {
                let mut incoming = vec![0f32; buffer.len()];
                for peer in peers.iter_mut() {
                    read_frame(peer)?.read_floats_into(TAG_GRADIENTS, &mut incoming)?;
                    for (acc, value) in buffer.iter_mut().zip(&incoming) {
                        *acc += *value;
                    }
                }
                let divisor = self.world_size as f32;
                for value in buffer.iter_mut() {
                    *value /= divisor;
                }
                let reply = Frame::floats(TAG_GRADIENTS, buffer);
                for peer in peers.iter_mut() {
                    write_frame(peer, &reply)?;
                }
            }
            Links::Peer { root } => {
                write_frame(root, &Frame::floats(TAG_GRADIENTS, buffer))?;
                read_frame(root)?.read_floats_into(TAG_GRADIENTS, buffer)?;
            }
        }
        Ok(())
    }

    /// Overwrites `buffer` on every rank with rank 0's contents.
    pub fn broadcast(&self, buffer: &mut [f32]) -> Result<(), TrainingError> {
        let mut links = self
            .links
            .lock()
            .map_err(|_| TrainingError::runtime("process group lock poisoned"))?;

        match &mut *links {
            Links::Root { peers, .. } => {
                let frame = Frame::floats(TAG_PARAMETERS, buffer);
                for peer in peers.iter_mut() {
                    write_frame(peer, &frame)?;
                }
            }
            Links::Peer { root } => {
                read_frame(root)?.read_floats_into(TAG_PARAMETERS, buffer)?;
            }
        }
        Ok(())
    }

    /// Exchanges goodbyes so rank 0 knows every peer finished its last
    /// collective, then closes the sockets.
    pub fn teardown(self) -> Result<(), TrainingError> {
        let links = self
            .links
            .into_inner()
            .map_err(|_| TrainingError::runtime("process group lock poisoned"))?;

        match links {
            Links::Root { listener, mut peers } => {
                for peer in peers.iter_mut() {
                    read_frame(peer)?.expect(TAG_GOODBYE)?;
                }
                for peer in peers.iter_mut() {
                    write_frame(peer, &Frame::empty(TAG_GOODBYE))?;
                }
                drop(listener);
            }
            Links::Peer { mut root } => {
                write_frame(&mut root, &Frame::empty(TAG_GOODBYE))?;
                read_frame(&mut root)?.expect(TAG_GOODBYE)?;
            }
        }
        debug!(rank = self.rank, "process group torn down");
        Ok(())
    }
}

fn accept_peers(
    listener: &TcpListener,
    world_size: usize,
    addr: &str,
) -> Result<Vec<TcpStream>, TrainingError> {
    let mut joined: BTreeMap<usize, TcpStream> = BTreeMap::new();
    while joined.len() < world_size - 1 {
        let (mut stream, remote) = listener
            .accept()
            .map_err(|err| TrainingError::rendezvous(format!("accept on {addr} failed: {err}")))?;
        stream.set_nodelay(true)?;

        let (rank, peer_world) = read_frame(&mut stream)?.parse_hello()?;
        let problem = if peer_world != world_size {
            Some(format!(
                "rank {rank} expects world size {peer_world}, group has {world_size}"
            ))
        } else if rank == 0 || rank >= world_size {
            Some(format!("rank {rank} is not a valid peer rank"))
        } else if joined.contains_key(&rank) {
            Some(format!("rank {rank} joined twice"))
        } else {
            None
        };

        if let Some(reason) = problem {
            let _ = write_frame(&mut stream, &Frame::reject(&reason));
            return Err(TrainingError::rendezvous(reason));
        }

        debug!(rank, %remote, "peer joined");
        joined.insert(rank, stream);
    }

    let mut peers: Vec<TcpStream> = joined.into_values().collect();
    for peer in peers.iter_mut() {
        write_frame(peer, &Frame::empty(TAG_WELCOME))?;
    }
    Ok(peers)
}

fn join_root(rank: usize, world_size: usize, addr: &str) -> Result<TcpStream, TrainingError> {
    let mut stream = loop {
        match TcpStream::connect(addr) {
            Ok(stream) => break stream,
            Err(err) if err.kind() == ErrorKind::ConnectionRefused => {
                thread::sleep(CONNECT_RETRY);
            }
            Err(err) => {
                return Err(TrainingError::rendezvous(format!(
                    "failed to reach {addr}: {err}"
                )))
            }
        }
    };
    stream.set_nodelay(true)?;

    write_frame(&mut stream, &Frame::hello(rank, world_size))?;
    let answer = read_frame(&mut stream)?;
    match answer.tag {
        TAG_WELCOME => Ok(stream),
        TAG_REJECT => Err(TrainingError::rendezvous(format!(
            "rank 0 rejected rank {rank}: {}",
            answer.reason()
        ))),
        _ => answer.expect(TAG_WELCOME).map(|_| stream),
    }
}
