//! Foundation module - Core utilities and types
//!
//! This module provides fundamental utilities used throughout the framework:
//! - Logging initialisation
//! - Handle and key types for stable object references

pub mod collections;
pub mod logging;
