#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
// Allow acronyms like DND
#![allow(clippy::upper_case_acronyms)]

//! # Easel: the windowing and event core of the easel toolkit
//!
//! This crate bridges the asynchronous X11 protocol to the synchronous,
//! single-threaded event dispatch model the easel widget layer is written
//! against. It owns the display connection, the timer queue and the event
//! queue, and implements the small stateful sub-protocols a toolkit needs to
//! be a well-behaved X11 citizen: selection/clipboard transfers (including
//! INCR chunking), the Xdnd drag-and-drop handshake, input-method
//! composition with an on-the-spot preedit popup, and pointer/keyboard
//! grabs with an XInput2 fast path.
//!
//! ## Structure of the crate
//!
//! - [`core`] holds the [`Core`](core::Core) session object and the
//!   [`EaselHandler`](core::EaselHandler) trait the application implements.
//!   One `Core` owns one display connection and everything hanging off it.
//! - [`x11`] contains the protocol plumbing: connection management and
//!   capability discovery, the window registry and its requested/confirmed
//!   state machine, event translation, grabs, selections, drag-and-drop and
//!   the input-method bridge.
//! - [`event`], [`timer`] and [`widget`] are the platform-independent
//!   pieces: the semantic event model and FIFO, the deadline-sorted timer
//!   queue and the generational widget arena.
//!
//! ## General principles
//!
//! Everything runs on one thread. The application state owns the `Core` and
//! hands out access through `EaselHandler::core_state`, so callbacks receive
//! `&mut` access to both the application and the core without any locking.
//! Other threads may only talk to the UI thread through the
//! [`EventPoster`](core::EventPoster), which injects records and wakes the
//! blocked wait primitive through an eventfd.
//!
//! ## Logging
//!
//! Easel makes extensive use of [`tracing`] for its internal logging.
//! Initialize a subscriber in your application binary to see it.

pub mod core;
pub mod event;
pub mod timer;
pub mod utils;
pub mod widget;
pub mod x11;

pub mod reexports;
