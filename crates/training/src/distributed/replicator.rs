use std::sync::Arc;

use candle_core::{backprop::GradStore, DType, Device, Tensor, Var};

use super::ProcessGroup;
use crate::{masks::MaskSet, model::Seq2SeqModel, TrainingError};

/// Wraps a model so that `backward` hands back gradients already averaged
/// across the process group.
///
/// Construction copies rank 0's parameters to every other rank, so replicas
/// start identical and stay identical under the shared averaged update.
pub struct ReplicatedModel<M> {
    model: M,
    group: Option<Arc<ProcessGroup>>,
    parameters: Vec<(String, Var)>,
}

impl<M: Seq2SeqModel> ReplicatedModel<M> {
    pub fn new(model: M, group: Option<Arc<ProcessGroup>>) -> Result<Self, TrainingError> {
        let parameters = model.parameters();
        if parameters.is_empty() {
            return Err(TrainingError::initialization(
                "model exposes no trainable parameters",
            ));
        }
        if let Some(group) = group.as_ref() {
            sync_parameters(group, &parameters)?;
        }
        Ok(Self {
            model,
            group,
            parameters,
        })
    }

    pub fn forward(
        &self,
        prompt: &Tensor,
        decoder_input: &Tensor,
        masks: &MaskSet,
        compute_dtype: DType,
    ) -> Result<Tensor, TrainingError> {
        Ok(self
            .model
            .forward(prompt, decoder_input, masks, compute_dtype)?)
    }

    pub fn backward(&self, loss: &Tensor) -> Result<GradStore, TrainingError> {
        let mut grads = loss.backward()?;
        let Some(group) = self.group.as_ref() else {
            return Ok(grads);
        };

        let total: usize = self.parameters.iter().map(|(_, var)| var.elem_count()).sum();
        let mut flat = Vec::with_capacity(total);
        for (_, var) in &self.parameters {
            match grads.get(var.as_tensor()) {
                Some(grad) => flat.extend(
                    grad.to_dtype(DType::F32)?
                        .flatten_all()?
                        .to_device(&Device::Cpu)?
                        .to_vec1::<f32>()?,
                ),
                None => flat.extend(std::iter::repeat(0f32).take(var.elem_count())),
            }
        }

        group.all_reduce_mean(&mut flat)?;

        let mut offset = 0;
        for (_, var) in &self.parameters {
            let tensor = var.as_tensor();
            let count = tensor.elem_count();
            let dtype = grads
                .get(tensor)
                .map(|grad| grad.dtype())
                .unwrap_or_else(|| tensor.dtype());
            let reduced = Tensor::from_slice(&flat[offset..offset + count], tensor.dims(), tensor.device())?
                .to_dtype(dtype)?;
            grads.insert(tensor, reduced);
            offset += count;
        }

        Ok(grads)
    }

    pub fn parameters(&self) -> &[(String, Var)] {
        &self.parameters
    }

    pub fn parameter_count(&self) -> usize {
        self.parameters.iter().map(|(_, var)| var.elem_count()).sum()
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_parts(self) -> (M, Option<Arc<ProcessGroup>>) {
        (self.model, self.group)
    }
}

fn sync_parameters(group: &ProcessGroup, parameters: &[(String, Var)]) -> Result<(), TrainingError> {
    let mut flat = Vec::new();
    for (_, var) in parameters {
        flat.extend(
            var.as_tensor()
                .to_dtype(DType::F32)?
                .flatten_all()?
                .to_device(&Device::Cpu)?
                .to_vec1::<f32>()?,
        );
    }

    group.broadcast(&mut flat)?;

    let mut offset = 0;
    for (_, var) in parameters {
        let tensor = var.as_tensor();
        let count = tensor.elem_count();
        let synced = Tensor::from_slice(&flat[offset..offset + count], tensor.dims(), tensor.device())?
            .to_dtype(tensor.dtype())?;
        var.set(&synced)?;
        offset += count;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::distributed::tests::free_addr;

    struct TwoWeights {
        first: Var,
        second: Var,
    }

    impl TwoWeights {
        fn new() -> Self {
            Self::with_values([1.0, 2.0], 0.5)
        }

        fn with_values(first: [f32; 2], second: f32) -> Self {
            Self {
                first: Var::new(&first, &Device::Cpu).unwrap(),
                second: Var::new(&[second], &Device::Cpu).unwrap(),
            }
        }
    }

    impl Seq2SeqModel for TwoWeights {
        fn forward(
            &self,
            _prompt: &Tensor,
            _decoder_input: &Tensor,
            _masks: &MaskSet,
            _compute_dtype: DType,
        ) -> candle_core::Result<Tensor> {
            Ok(self.first.as_tensor().clone())
        }

        fn parameters(&self) -> Vec<(String, Var)> {
            vec![
                ("first".to_string(), self.first.clone()),
                ("second".to_string(), self.second.clone()),
            ]
        }
    }

    fn grad_of(grads: &GradStore, var: &Var) -> Vec<f32> {
        grads.get(var.as_tensor()).unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn single_process_backward_is_plain_backprop() {
        let model = ReplicatedModel::new(TwoWeights::new(), None).unwrap();
        let first = model.model().first.clone();
        let loss = first.as_tensor().affine(3.0, 0.0).unwrap().sum_all().unwrap();
        let grads = model.backward(&loss).unwrap();
        assert_eq!(grad_of(&grads, &first), vec![3.0, 3.0]);
        assert!(grads.get(model.model().second.as_tensor()).is_none());
        assert_eq!(model.parameter_count(), 3);
    }

    #[test]
    fn gradients_are_averaged_and_missing_ones_count_as_zero() {
        let addr = free_addr();
        let peer_addr = addr.clone();

        let peer = thread::spawn(move || {
            let group = Arc::new(ProcessGroup::setup(1, 2, &peer_addr).unwrap());
            let model =
                ReplicatedModel::new(TwoWeights::with_values([9.0, 9.0], 9.0), Some(group)).unwrap();
            let (first, second) = (model.model().first.clone(), model.model().second.clone());
            assert_eq!(first.as_tensor().to_vec1::<f32>().unwrap(), vec![1.0, 2.0]);
            assert_eq!(second.as_tensor().to_vec1::<f32>().unwrap(), vec![0.5]);
            // rank 1 touches both parameters
            let loss = first
                .as_tensor()
                .affine(3.0, 0.0)
                .unwrap()
                .sum_all()
                .unwrap()
                .add(&second.as_tensor().affine(4.0, 0.0).unwrap().sum_all().unwrap())
                .unwrap();
            let grads = model.backward(&loss).unwrap();
            (grad_of(&grads, &first), grad_of(&grads, &second))
        });

        let group = Arc::new(ProcessGroup::setup(0, 2, &addr).unwrap());
        let model = ReplicatedModel::new(TwoWeights::new(), Some(group)).unwrap();
        let (first, second) = (model.model().first.clone(), model.model().second.clone());
        let loss = first.as_tensor().sum_all().unwrap();
        let grads = model.backward(&loss).unwrap();
        let local = (grad_of(&grads, &first), grad_of(&grads, &second));

        let remote = peer.join().unwrap();
        assert_eq!(local.0, vec![2.0, 2.0]);
        assert_eq!(local.1, vec![2.0]);
        assert_eq!(local, remote);
    }
}
