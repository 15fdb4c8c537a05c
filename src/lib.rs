pub mod boot;
pub mod clock;
pub mod engine;
pub mod leap;
pub mod measure;
pub mod pmc;
pub mod servo;
pub mod stats;
