//! External directory API access.

mod client;
mod types;

pub use client::{
  DirectoryClient, DirectoryError, EnvTokenSource, HttpDirectoryClient, TokenSource,
};
pub use types::GroupInfo;
