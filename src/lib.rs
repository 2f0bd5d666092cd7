pub mod velokeys;
