// ABOUTME: Shared configuration names for devbox crates
// ABOUTME: Re-exports environment variable name constants

pub mod constants;
