pub mod random;
pub mod temp;
