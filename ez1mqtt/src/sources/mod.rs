pub mod ez1;
pub mod fake;
pub mod inverter;
