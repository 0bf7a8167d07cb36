//! # Brief Forge
//!
//! A multi-tenant backend for AI-generated short-form video creative briefs.
//!
//! Brief Forge lets e-commerce sellers connect their shops, generate
//! structured creative briefs with a hosted LLM, maintain a personal
//! knowledge base alongside an admin-curated global one, chat with a
//! retrieval-augmented copilot (JSON or SSE streaming), and browse market
//! intelligence from an external analytics provider.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────────────┐   ┌──────────┐
//! │  Client  │──▶│   Axum API (/api/v1) │──▶│  SQLite   │
//! └──────────┘   │  auth · shops · cr   │   └──────────┘
//!                │  knowledge · copilot │
//!                │  market · fastmoss   │
//!                └──────┬──────┬────────┘
//!                       ▼      ▼
//!               ┌──────────┐ ┌──────────────┐
//!               │ LLM API  │ │ Vector index │
//!               │ + embed  │ │ (2 namespaces)│
//!               └──────────┘ └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! brief-forge init     # create database
//! brief-forge serve    # start the API server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`auth`] | Password hashing, JWTs, bearer extractor |
//! | [`shops`] | Shop CRUD routes |
//! | [`projects`] | Creative-brief projects and generation |
//! | [`brief`] | Brief prompts and model-output parsing |
//! | [`knowledge`] | User and global knowledge routes |
//! | [`copilot`] | Retrieval-augmented chat (JSON + SSE) |
//! | [`ai`] | Hosted LLM client |
//! | [`embedding`] | Embedding providers |
//! | [`vector`] | Hosted vector index client |
//! | [`market`] | Trend queries over local snapshots |
//! | [`fastmoss`] | External analytics client and proxy |
//! | [`server`] | Axum HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod ai;
pub mod auth;
pub mod brief;
pub mod config;
pub mod copilot;
pub mod db;
pub mod embedding;
pub mod fastmoss;
pub mod knowledge;
pub mod market;
pub mod migrate;
pub mod models;
pub mod projects;
pub mod server;
pub mod shops;
pub mod vector;
