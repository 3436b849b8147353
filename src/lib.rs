//! ragcore — a retrieval-augmented question answering service.
//!
//! The sixteen components (config, metadata/vector storage, embedding,
//! chunking, document processing, ingestion, LLM access, reranking, query
//! enhancement, query/conversation engines, folder watching, health
//! monitoring, service wiring, and the HTTP surface) each live in their own
//! module; `http::create_app` assembles them into the service's router.

#![allow(unused_variables)]

pub mod chunking;
pub mod config;
pub mod container;
pub mod conversation;
pub mod embedder;
pub mod embeddings;
pub mod enhancer;
pub mod errors;
pub mod folder_monitor;
pub mod heartbeat;
pub mod http;
pub mod ingestion;
pub mod llm;
pub mod llm_client;
pub mod logging;
pub mod metadata_store;
pub mod processing;
pub mod processor_registry;
pub mod query_engine;
pub mod rag;
pub mod reranker;
pub mod reranking;
pub mod storage;
pub mod types;
pub mod vector_store;

pub use config::RAGConfig;
pub use errors::{RagError, RagResult};
