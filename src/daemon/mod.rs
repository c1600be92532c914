pub mod batch;
pub mod config;
pub mod errors;
pub mod git_ops;
pub mod manager;
pub mod repo_config;
pub mod scheduler;

#[cfg(test)]
pub mod test_support;
