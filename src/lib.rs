//! Receipt Processing Pipeline
//!
//! This library turns photographed receipts into structured expense data.
//! It owns the asynchronous processing queue (AI extraction with retry,
//! timeout-with-user-choice, and offline OCR fallback) and the two
//! extraction pipelines: the AI response parser and the heuristic OCR
//! text extractor.

pub mod config;
pub mod models;
pub mod services;
