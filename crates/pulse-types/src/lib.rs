pub mod domain;
pub mod event;
pub mod run;

pub use domain::*;
pub use event::*;
pub use run::*;
