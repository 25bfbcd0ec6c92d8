// =============================================================================
// Matrixon Sync - Service Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Services making up a sync client: signal delivery, room state, storage,
//   transport and the sync strategies themselves.
//
// =============================================================================

pub mod rooms;
pub mod signals;
pub mod storage;
pub mod sync;
pub mod transport;
