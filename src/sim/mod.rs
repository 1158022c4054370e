pub mod radiosity;
