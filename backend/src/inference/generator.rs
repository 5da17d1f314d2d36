//! Enhancement generator: encoder, three residual blocks, decoder.
//!
//! Variable paths mirror the layout of the trained checkpoint
//! (`encoder.0.weight`, `residual_blocks.1.bn2.running_var`, `decoder.7.bias`)
//! so exported weights load without any renaming. Indices skipped in the
//! encoder and decoder belong to parameterless activations.

use std::io::Cursor;
use std::sync::Mutex;
use tch::nn::{self, ModuleT};
use tch::{Device, TchError, Tensor};

use super::ImageModel;

const RESIDUAL_BLOCKS: usize = 3;
const BODY_CHANNELS: i64 = 128;

fn conv3x3<'a>(p: nn::Path<'a>, c_in: i64, c_out: i64) -> nn::Conv2D {
    let config = nn::ConvConfig {
        padding: 1,
        ..Default::default()
    };
    nn::conv2d(p, c_in, c_out, 3, config)
}

#[derive(Debug)]
struct ResidualBlock {
    conv1: nn::Conv2D,
    bn1: nn::BatchNorm,
    conv2: nn::Conv2D,
    bn2: nn::BatchNorm,
}

impl ResidualBlock {
    fn new(p: nn::Path, channels: i64) -> Self {
        Self {
            conv1: conv3x3(&p / "conv1", channels, channels),
            bn1: nn::batch_norm2d(&p / "bn1", channels, Default::default()),
            conv2: conv3x3(&p / "conv2", channels, channels),
            bn2: nn::batch_norm2d(&p / "bn2", channels, Default::default()),
        }
    }
}

impl ModuleT for ResidualBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let out = xs
            .apply(&self.conv1)
            .apply_t(&self.bn1, train)
            .relu()
            .apply(&self.conv2)
            .apply_t(&self.bn2, train);
        out + xs
    }
}

#[derive(Debug)]
pub struct Generator {
    encoder: nn::SequentialT,
    residual_blocks: Vec<ResidualBlock>,
    decoder: nn::SequentialT,
}

impl Generator {
    pub fn new(p: &nn::Path) -> Self {
        let enc = p / "encoder";
        let encoder = nn::seq_t()
            .add(conv3x3(&enc / 0, 3, 64))
            .add(nn::batch_norm2d(&enc / 1, 64, Default::default()))
            .add_fn(|xs| xs.relu())
            .add(conv3x3(&enc / 3, 64, BODY_CHANNELS))
            .add(nn::batch_norm2d(&enc / 4, BODY_CHANNELS, Default::default()))
            .add_fn(|xs| xs.relu());

        let blocks = p / "residual_blocks";
        let residual_blocks = (0..RESIDUAL_BLOCKS)
            .map(|i| ResidualBlock::new(&blocks / i, BODY_CHANNELS))
            .collect();

        let dec = p / "decoder";
        let decoder = nn::seq_t()
            .add_fn(|xs| xs.relu())
            .add(conv3x3(&dec / 1, BODY_CHANNELS, 64))
            .add(nn::batch_norm2d(&dec / 2, 64, Default::default()))
            .add_fn(|xs| xs.relu())
            .add(conv3x3(&dec / 4, 64, 64))
            .add(nn::batch_norm2d(&dec / 5, 64, Default::default()))
            .add_fn(|xs| xs.relu())
            .add(conv3x3(&dec / 7, 64, 3))
            .add_fn(|xs| xs.tanh());

        Self {
            encoder,
            residual_blocks,
            decoder,
        }
    }
}

impl ModuleT for Generator {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let mut xs = self.encoder.forward_t(xs, train);
        for block in &self.residual_blocks {
            xs = block.forward_t(&xs, train);
        }
        self.decoder.forward_t(&xs, train)
    }
}

/// Generator with trained weights, ready for inference.
pub struct LoadedGenerator {
    net: Mutex<Generator>,
    _vs: nn::VarStore,
    device: Device,
}

impl LoadedGenerator {
    /// Builds the architecture on `device` and copies the serialized weights in.
    pub fn load(bytes: &[u8], device: Device) -> Result<Self, TchError> {
        let mut vs = nn::VarStore::new(device);
        let net = Generator::new(&vs.root());
        vs.load_from_stream(Cursor::new(bytes))?;
        vs.freeze();
        Ok(Self {
            net: Mutex::new(net),
            _vs: vs,
            device,
        })
    }
}

impl ImageModel for LoadedGenerator {
    fn forward(&self, input: &Tensor) -> Result<Tensor, TchError> {
        let size = input.size();
        if size.len() != 4 || size[0] != 1 || size[1] != 3 {
            return Err(TchError::Shape(format!(
                "generator expects a [1, 3, H, W] batch, got {:?}",
                size
            )));
        }
        let net = self
            .net
            .lock()
            .map_err(|_| TchError::Torch("generator lock poisoned".to_string()))?;
        let input = input.to_device(self.device);
        let output = tch::no_grad(|| net.forward_t(&input, false));
        Ok(output.to_device(Device::Cpu))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    #[test]
    fn parameter_names_follow_checkpoint_layout() {
        let vs = nn::VarStore::new(Device::Cpu);
        let _net = Generator::new(&vs.root());
        let variables = vs.variables();

        for name in [
            "encoder.0.weight",
            "encoder.1.running_mean",
            "encoder.3.bias",
            "encoder.4.running_var",
            "residual_blocks.0.conv1.weight",
            "residual_blocks.2.bn2.bias",
            "decoder.1.weight",
            "decoder.5.running_mean",
            "decoder.7.bias",
        ] {
            assert!(variables.contains_key(name), "missing {}", name);
        }
        assert!(!variables.contains_key("decoder.0.weight"));
        // 11 convolutions (weight, bias) and 10 batch norms (weight, bias, running stats)
        assert_eq!(variables.len(), 11 * 2 + 10 * 4);
        assert_eq!(variables["encoder.3.weight"].size(), vec![128, 64, 3, 3]);
        assert_eq!(variables["decoder.7.weight"].size(), vec![3, 64, 3, 3]);
    }

    #[test]
    fn output_keeps_input_shape_and_tanh_range() {
        let vs = nn::VarStore::new(Device::Cpu);
        let net = Generator::new(&vs.root());
        let input = Tensor::randn([1, 3, 256, 256], (Kind::Float, Device::Cpu));

        let output = tch::no_grad(|| net.forward_t(&input, false));

        assert_eq!(output.size(), input.size());
        let max = output.abs().max().double_value(&[]);
        assert!(max <= 1.0);
    }

    #[test]
    fn loads_weights_saved_from_the_same_architecture() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("generator.ot");
        let vs = nn::VarStore::new(Device::Cpu);
        let _net = Generator::new(&vs.root());
        vs.save(&path).unwrap();
        let bytes = std::fs::read(&path).unwrap();

        let loaded = LoadedGenerator::load(&bytes, Device::Cpu).unwrap();
        let input = Tensor::zeros([1, 3, 32, 48], (Kind::Float, Device::Cpu));
        let output = loaded.forward(&input).unwrap();

        assert_eq!(output.size(), vec![1, 3, 32, 48]);
    }

    #[test]
    fn rejects_malformed_weights() {
        assert!(LoadedGenerator::load(b"definitely not a checkpoint", Device::Cpu).is_err());
    }

    #[test]
    fn rejects_batches_with_wrong_channel_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("generator.ot");
        let vs = nn::VarStore::new(Device::Cpu);
        let _net = Generator::new(&vs.root());
        vs.save(&path).unwrap();
        let loaded = LoadedGenerator::load(&std::fs::read(&path).unwrap(), Device::Cpu).unwrap();

        let grayscale = Tensor::zeros([1, 1, 16, 16], (Kind::Float, Device::Cpu));
        assert!(matches!(loaded.forward(&grayscale), Err(TchError::Shape(_))));
    }
}
