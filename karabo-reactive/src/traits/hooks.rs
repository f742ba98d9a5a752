/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

use async_trait::async_trait;

use crate::hash::Hash;
use crate::signalslot::SignalSlotable;

/// Life-cycle hooks of an instance.
///
/// Every method has a default that does nothing, so implementors override
/// only what they need. Hooks run on the instance's own tasks; the bounded
/// ones are cut off after the configured limit.
#[async_trait]
pub trait InstanceHooks: Send + Sync + 'static {
    /// Runs before the instance is considered up. An error or overrunning
    /// the time limit kills the instance.
    async fn pre_initialization(&self, _instance: &SignalSlotable) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs concurrently once the instance is up. An error kills the instance.
    async fn on_initialization(&self, _instance: &SignalSlotable) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs first during shutdown. Errors are logged.
    async fn on_destruction(&self, _instance: &SignalSlotable) -> anyhow::Result<()> {
        Ok(())
    }

    /// Vets a reconfiguration that passed schema validation. An error
    /// rejects it before anything is applied.
    async fn on_reconfigure(&self, _instance: &SignalSlotable, _changes: &Hash) -> anyhow::Result<()> {
        Ok(())
    }

    /// A slot failed.
    async fn on_exception(
        &self,
        _instance: &SignalSlotable,
        _slot: &str,
        _error: &anyhow::Error,
        _traceback: &str,
    ) {
    }

    /// A slot was cancelled.
    async fn on_cancelled(&self, _instance: &SignalSlotable, _slot: &str) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl InstanceHooks for NoHooks {}
