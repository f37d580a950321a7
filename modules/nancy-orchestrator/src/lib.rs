pub mod facade;
pub mod wiring;

pub use facade::{FileIngest, Nancy, NancyConfig};
pub use wiring::{connect_brains, nancy_config};
