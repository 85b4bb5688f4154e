pub mod mem_transport;
