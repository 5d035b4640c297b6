//! Nexus Core
//!
//! Core types for the Nexus GPU job scheduler.
//!
//! This crate contains:
//! - Domain types: Core business entities (Job, GpuInfo, Artifact)
//! - DTOs: Request and response models for the HTTP API

pub mod domain;
pub mod dto;
