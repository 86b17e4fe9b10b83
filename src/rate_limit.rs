// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Rate Limiting
//!
//! Token bucket limiting how many `MSG` commands one session may send.
//! Each session owns its bucket, so there is no shared state to lock.

use std::time::Instant;

/// Token bucket for one session.
#[derive(Debug)]
pub struct SendBudget {
    /// Current number of tokens.
    tokens: f64,
    /// Maximum tokens (bucket capacity). Zero disables limiting.
    max_tokens: f64,
    /// Tokens added per second.
    refill_rate: f64,
    /// Last time tokens were updated.
    last_update: Instant,
}

impl SendBudget {
    /// Allows `max_per_minute` sends per minute with bursts of the same size.
    /// `0` means unlimited.
    pub fn per_minute(max_per_minute: u32) -> Self {
        SendBudget {
            tokens: max_per_minute as f64,
            max_tokens: max_per_minute as f64,
            refill_rate: max_per_minute as f64 / 60.0,
            last_update: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_update = now;
    }

    /// Tries to spend one token.
    ///
    /// Returns true if the send is allowed.
    pub fn try_consume(&mut self) -> bool {
        self.try_consume_at(Instant::now())
    }

    fn try_consume_at(&mut self, now: Instant) -> bool {
        if self.max_tokens == 0.0 {
            return true;
        }
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
