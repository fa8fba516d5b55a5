pub mod api;
pub mod browser;
pub mod estimate;
pub mod knowledge;
pub mod labor;
pub mod llm;
pub mod ports;
pub mod price;
pub mod pricing;
pub mod research;
pub mod vin;

pub use api::*;
pub use browser::*;
pub use estimate::*;
pub use knowledge::*;
pub use labor::*;
pub use llm::*;
pub use ports::*;
pub use price::*;
pub use pricing::*;
pub use research::*;
pub use vin::*;
