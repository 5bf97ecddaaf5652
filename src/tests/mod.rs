pub mod support;

mod failover_tests;
mod integration_tests;
mod transport_tests;
