/*
 * SPDX-FileCopyrightText: 2022-2025 The otakit developers
 * SPDX-License-Identifier: GPL-3.0-only
 */

pub mod ab;
pub mod device;
pub mod finalize;
pub mod merge;
pub mod metadata;
pub mod nonab;
pub mod payload;
pub mod sign;
