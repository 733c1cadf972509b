pub mod builders;
pub mod db;

pub use builders::GroupBuilder;
pub use db::TestDb;
