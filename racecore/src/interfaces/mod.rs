pub mod snapshot_interface;
