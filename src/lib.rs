pub mod builder;
pub mod classify;
pub mod config;
pub mod dissolve;
pub mod error;
pub mod etl;
pub mod io;
pub mod mbtiles;
pub mod mercator;
pub mod model;
pub mod server;
pub mod validate;
pub mod vector_tile;
