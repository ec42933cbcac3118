//! Accelerator runtime seam.
//!
//! The server never touches the device directly: each session creates one
//! [`AcceleratorRuntime`] through a [`RuntimeFactory`] and drives it with load, bind-input,
//! submit and read-output calls. [`HostRuntime`] implements the interface on the host CPU
//! so the server can run without hardware attached.
use log::{debug, info};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime could not be created: {0}")]
    Create(String),

    #[error("binary image rejected: {0}")]
    Load(String),

    #[error("no binary image loaded")]
    NotLoaded,

    #[error("no input bound")]
    NoInput,

    #[error("input of {got} bytes does not fit tensor of {capacity} bytes")]
    InputSize { got: usize, capacity: usize },

    #[error("execution failed: {0}")]
    Execution(String),
}

pub trait AcceleratorRuntime: Send {
    fn num_devices(&self) -> i64;

    fn max_devices(&self) -> i64;

    /// Loads a compiled binary image, replacing whatever was loaded before.
    fn load(&mut self, image: &[u8]) -> Result<(), RuntimeError>;

    fn unload(&mut self);

    /// Copies `data` into the input tensor of the loaded image.
    fn bind_input(&mut self, data: &[u8]) -> Result<(), RuntimeError>;

    /// Runs the loaded image on the bound input.
    fn submit(&mut self) -> Result<(), RuntimeError>;

    /// Copies `size` bytes out of the output tensor of the last submission.
    fn read_output(&mut self, size: usize) -> Result<Vec<u8>, RuntimeError>;
}

pub trait RuntimeFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn AcceleratorRuntime>, RuntimeError>;
}

impl<F> RuntimeFactory for F
where
    F: Fn() -> Result<Box<dyn AcceleratorRuntime>, RuntimeError> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn AcceleratorRuntime>, RuntimeError> {
        self()
    }
}

/// Host-side stand-in for a single accelerator.
///
/// The output of a submission is the bound input folded with the loaded image: byte `i`
/// is `input[i % input.len()] ^ image[i % image.len()]`.
#[derive(Debug, Default)]
pub struct HostRuntime {
    image: Option<Vec<u8>>,
    input: Option<Vec<u8>>,
    output: Vec<u8>,
    submitted: bool,
}

/// Largest input tensor the host runtime accepts.
pub const HOST_INPUT_CAPACITY: usize = 64 << 20;

impl HostRuntime {
    pub fn factory() -> impl RuntimeFactory {
        || -> Result<Box<dyn AcceleratorRuntime>, RuntimeError> {
            Ok(Box::new(HostRuntime::default()))
        }
    }
}

impl AcceleratorRuntime for HostRuntime {
    fn num_devices(&self) -> i64 {
        1
    }

    fn max_devices(&self) -> i64 {
        1
    }

    fn load(&mut self, image: &[u8]) -> Result<(), RuntimeError> {
        if image.is_empty() {
            return Err(RuntimeError::Load("empty image".to_string()));
        }
        self.image = Some(image.to_vec());
        self.input = None;
        self.submitted = false;
        info!("host runtime loaded {} byte image", image.len());
        Ok(())
    }

    fn unload(&mut self) {
        if self.image.take().is_some() {
            debug!("host runtime unloaded image");
        }
        self.input = None;
        self.output.clear();
        self.submitted = false;
    }

    fn bind_input(&mut self, data: &[u8]) -> Result<(), RuntimeError> {
        if self.image.is_none() {
            return Err(RuntimeError::NotLoaded);
        }
        if data.len() > HOST_INPUT_CAPACITY {
            return Err(RuntimeError::InputSize {
                got: data.len(),
                capacity: HOST_INPUT_CAPACITY,
            });
        }
        self.input = Some(data.to_vec());
        Ok(())
    }

    fn submit(&mut self) -> Result<(), RuntimeError> {
        let image = self.image.as_ref().ok_or(RuntimeError::NotLoaded)?;
        let input = self.input.as_ref().ok_or(RuntimeError::NoInput)?;
        if input.is_empty() {
            return Err(RuntimeError::Execution("empty input".to_string()));
        }

        let len = input.len().max(image.len());
        self.output = (0..len)
            .map(|i| input[i % input.len()] ^ image[i % image.len()])
            .collect();
        self.submitted = true;
        Ok(())
    }

    fn read_output(&mut self, size: usize) -> Result<Vec<u8>, RuntimeError> {
        if !self.submitted {
            return Err(RuntimeError::Execution("nothing submitted".to_string()));
        }
        let mut output = Vec::new();
        output
            .try_reserve_exact(size)
            .map_err(|e| RuntimeError::Execution(format!("output of {size} bytes: {e}")))?;
        output.extend((0..size).map(|i| self.output[i % self.output.len()]));
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_folds_input_with_image() {
        let mut rt = HostRuntime::default();
        rt.load(&[0xff, 0x00]).unwrap();
        rt.bind_input(&[1, 2, 3]).unwrap();
        rt.submit().unwrap();

        assert_eq!(rt.read_output(4).unwrap(), vec![0xfe, 0x02, 0xfc, 0xfe]);
    }

    #[test]
    fn input_requires_loaded_image() {
        let mut rt = HostRuntime::default();

        assert!(matches!(rt.bind_input(&[1]), Err(RuntimeError::NotLoaded)));
        assert!(matches!(rt.submit(), Err(RuntimeError::NotLoaded)));
    }

    #[test]
    fn unload_discards_results() {
        let mut rt = HostRuntime::default();
        rt.load(&[1]).unwrap();
        rt.bind_input(&[1]).unwrap();
        rt.submit().unwrap();
        rt.unload();

        assert!(rt.read_output(1).is_err());
    }

    #[test]
    fn impossible_output_size_is_an_error() {
        let mut rt = HostRuntime::default();
        rt.load(&[1]).unwrap();
        rt.bind_input(&[1]).unwrap();
        rt.submit().unwrap();

        assert!(matches!(
            rt.read_output(usize::MAX),
            Err(RuntimeError::Execution(_))
        ));
    }

    #[test]
    fn factory_creates_fresh_runtimes() {
        let factory = HostRuntime::factory();
        let rt = factory.create().unwrap();

        assert_eq!(rt.num_devices(), 1);
        assert_eq!(rt.max_devices(), 1);
    }
}
