/*
 * SPDX-FileCopyrightText: 2022-2025 The otakit developers
 * SPDX-License-Identifier: GPL-3.0-only
 */

pub mod ota;
pub mod payload;
pub mod rangeset;
pub mod zip;
