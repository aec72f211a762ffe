pub mod helpers;

mod tests_crud;
mod tests_recovery;
