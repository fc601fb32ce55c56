/*
 * This file is part of helmgate.
 *
 * Copyright (C) 2025 helmgate contributors
 *
 * helmgate is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * helmgate is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with helmgate. If not, see <https://www.gnu.org/licenses/>.
 */

//! helmgate - operator tooling for card + helmet access checkpoints
//!
//! The device itself runs `helmgated`; this crate is the command line an
//! operator uses on the same box to inspect the audit log, maintain the
//! authorization table and force a reconciliation with the remote service.

pub mod cli;
pub mod logger;

#[cfg(test)]
pub mod test_utils;
