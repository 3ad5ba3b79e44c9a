// Copyright 2022 Lucas Javaudin
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// https://creativecommons.org/licenses/by-nc-nd/4.0/legalcode

//! Progress bar and spinner for the library.
use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use log::{log_enabled, Level};

/// Progress bar are refreshed each UPDATE events.
const UPDATE: u64 = 1000;
/// Interval in milliseconds when spinners are automatically ticked.
const UPDATE_MS: Duration = Duration::from_millis(1000);

/// A progress bar over the decision inputs, shared by all the workers.
#[derive(Debug, Clone)]
pub struct DecisionProgressBar {
    bp: ProgressBar,
    current: Arc<AtomicU64>,
}

impl DecisionProgressBar {
    /// Returns a [DecisionProgressBar] of given length.
    ///
    /// The bar is hidden when info-level logging is disabled.
    pub fn new(length: usize) -> Self {
        let bp = if log_enabled!(Level::Info) {
            ProgressBar::new(length as u64)
        } else {
            ProgressBar::hidden()
        };
        if let Ok(style) = ProgressStyle::default_bar().template("{bar:40} {msg} ({eta})") {
            bp.set_style(style);
        }
        DecisionProgressBar {
            bp,
            current: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Sets a message to the [DecisionProgressBar].
    pub fn set_message(&self, msg: impl Into<Cow<'static, str>>) {
        self.bp.set_message(msg);
    }

    /// Increments the progress bar by one.
    ///
    /// The bar is refreshed only periodically.
    pub fn inc(&self) {
        let current = self.current.fetch_add(1, Ordering::Relaxed) + 1;
        if current % UPDATE == 0 {
            self.bp.inc(UPDATE);
        }
    }

    /// Returns the number of increments so far.
    pub fn position(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    /// Sets the progress bar to finished.
    pub fn finish(&self) {
        self.bp.finish_and_clear();
    }
}

/// A spinner.
#[derive(Debug)]
pub struct Spinner(ProgressBar);

impl Spinner {
    /// Starts a [Spinner] with the given message.
    pub fn new(msg: &str) -> Self {
        let bp = if log_enabled!(Level::Info) {
            ProgressBar::new(1).with_message(msg.to_owned())
        } else {
            ProgressBar::hidden()
        };
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner} {msg}") {
            bp.set_style(style);
        }
        bp.enable_steady_tick(UPDATE_MS);
        Spinner(bp)
    }

    /// Sets the spinner to finished.
    pub fn finish(&mut self) {
        self.0.finish_and_clear();
    }
}
