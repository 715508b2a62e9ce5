//! Voucher code extraction
//!
//! Turns photographs of printed vouchers into canonical 16-digit voucher
//! codes. Jobs are acquired (local path or URL), enhanced, recognized by a
//! single shared Tesseract engine across several image variants, scanned for
//! codes, filtered against an operator ban-list and merged into a result
//! store.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod services;
pub mod signals;
