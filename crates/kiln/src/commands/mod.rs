pub mod bake;
pub mod delete;
pub mod info;
pub mod list;
