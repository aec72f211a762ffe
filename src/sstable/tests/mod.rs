pub mod helpers;

mod tests_reader;
mod tests_writer;
