pub mod artifacts;
pub mod config;
pub mod dataset;
pub mod decode;
pub mod emotion;
pub mod evaluation;
pub mod features;
pub mod inference;
pub mod live;
pub mod model;
pub mod pipeline;
pub mod scaler;
pub mod training;
pub mod util;
