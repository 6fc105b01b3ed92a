pub mod helpers;
mod tests_basic;
mod tests_collision;
mod tests_historical;
mod tests_recovery;
mod tests_transport;
