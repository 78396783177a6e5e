// doh.rs
pub mod doh;
pub use doh::*;
