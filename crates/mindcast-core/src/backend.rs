use burn::backend::ndarray::NdArrayDevice;

pub type NdBackend = burn::backend::NdArray<f32>;

/// Backend used for training; wraps the CPU backend with autodiff.
pub type TrainBackend = burn::backend::Autodiff<NdBackend>;

pub fn init_device() -> NdArrayDevice {
    NdArrayDevice::default()
}
