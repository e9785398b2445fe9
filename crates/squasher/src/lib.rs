pub mod autodetector;
pub mod changes_file;
pub mod circular;
pub mod commands;
pub mod config;
pub mod definitions;
pub mod error;
pub mod loader;
pub mod migration;
pub mod operations;
pub mod parser;
pub mod resolver;
pub mod serializer;
pub mod source_utils;
pub mod unique_names;
pub mod writer;
