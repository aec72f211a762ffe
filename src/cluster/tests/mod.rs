pub mod helpers;

mod tests_fanout;
mod tests_ring;
mod tests_snowflake;
