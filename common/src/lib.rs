pub mod dma;
pub mod timeout;

pub use dma::Dma;
pub use timeout::Timeout;
