pub mod dispatcher;
pub mod format;
pub mod toolcall;
pub mod traits;

pub use dispatcher::*;
pub use format::*;
pub use toolcall::*;
pub use traits::*;
