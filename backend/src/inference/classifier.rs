use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use tch::{CModule, Device, IValue, TchError, Tensor};

use super::ImageModel;

/// Self-describing TorchScript classifier; the architecture travels with the weights.
pub struct TorchScriptClassifier {
    model: Mutex<CModule>,
    device: Device,
}

impl TorchScriptClassifier {
    /// Materializes the module through a scratch file that is removed when this
    /// returns, whether or not loading succeeded.
    pub fn load(bytes: &[u8], device: Device, scratch_dir: Option<&Path>) -> Result<Self, TchError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("dr-classifier-").suffix(".pt");
        let mut artifact = match scratch_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        artifact.write_all(bytes)?;
        artifact.flush()?;

        let mut model = CModule::load_on_device(artifact.path(), device)?;
        model.set_eval();
        Ok(Self {
            model: Mutex::new(model),
            device,
        })
    }
}

impl ImageModel for TorchScriptClassifier {
    fn forward(&self, input: &Tensor) -> Result<Tensor, TchError> {
        let model = self
            .model
            .lock()
            .map_err(|_| TchError::Torch("classifier lock poisoned".to_string()))?;
        let input = input.to_device(self.device);
        let output = tch::no_grad(|| model.forward_is(&[IValue::Tensor(input)]))?;
        match output {
            IValue::Tensor(tensor) => Ok(tensor.to_device(Device::Cpu)),
            IValue::Tuple(mut values) | IValue::GenericList(mut values) if !values.is_empty() => {
                match values.swap_remove(0) {
                    IValue::Tensor(tensor) => Ok(tensor.to_device(Device::Cpu)),
                    other => Err(TchError::Convert(format!(
                        "classifier returned a non-tensor output: {:?}",
                        other
                    ))),
                }
            }
            other => Err(TchError::Convert(format!(
                "classifier returned a non-tensor output: {:?}",
                other
            ))),
        }
    }
}
