//! Marcdex: rule-driven MARC/MAB XML loading and relationship linking
//!
//! This crate loads bibliographic and authority records into a document index
//! and then repairs the references between indexed documents:
//!
//! 1. **Rule compilation** -- A line-oriented rule file (`target = directive, ...`)
//!    is compiled into typed [`rules::FieldRule`]s with a tag prefilter
//! 2. **Loading** -- Records are streamed out of MARCXML (plain or `.bz2`), mapped
//!    through the rules and submitted in fixed-size batches, all stamped with one
//!    load timestamp
//! 3. **Linking** -- Four cursor-paginated phases restore parent/child references
//!    for documents written by the load; an authority pass recounts how often
//!    authority records are cited
//!
//! # Key Modules
//!
//! - [`rules`] -- Rule tokenizer, directive parser and compiler
//! - [`matcher`] -- Address patterns with wildcard indicators and subfield codes
//! - [`transform`] -- Per-record mapping: existence, extraction, grouping, translation
//! - [`translation`] -- Key/value translation tables with per-file cache
//! - [`parser`] -- Streaming MARCXML reader
//! - [`loader`] -- Batching, bulk submission and the load outcome
//! - [`index`] -- Index-service trait, filters and cursor pagination
//! - [`solr`] -- HTTP index service
//! - [`memory`] -- In-memory index service for dry runs and tests
//! - [`link`] -- Parent/child and authority linkers
//! - [`stats`] -- Atomic run counters
//! - [`config`] -- Defaults
//!
//! # Example Usage
//!
//! ```bash
//! # Load two files and link the result
//! marcdex load -r rules/marc.properties records-1.xml records-2.xml.bz2 --link
//!
//! # Re-run linking for an earlier load
//! marcdex link --timestamp 1718000000000 --optimize
//!
//! # Recount authority citations for an earlier load
//! marcdex link-authority --timestamp 1718000000000
//! ```

pub mod config;
pub mod error;
pub mod index;
pub mod link;
pub mod loader;
pub mod matcher;
pub mod memory;
pub mod models;
pub mod parser;
pub mod rules;
pub mod solr;
pub mod stats;
pub mod transform;
pub mod translation;
