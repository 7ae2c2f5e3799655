pub mod inverter;
