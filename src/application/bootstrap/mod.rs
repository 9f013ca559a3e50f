pub mod services;

pub use services::App;
