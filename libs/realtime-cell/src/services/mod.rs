pub mod transport;
pub mod preference;
pub mod channel;
pub mod hub;

pub use transport::*;
pub use preference::*;
pub use channel::*;
pub use hub::*;
