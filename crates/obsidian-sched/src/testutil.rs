//! Shared unit-test doubles.

use crate::device::DeviceHooks;
use crate::error::{EmitError, ResetError};
use crate::ring::{EmitCtx, Emitter};
use crate::workaround::Workaround;

/// Hooks that always succeed and touch nothing.
#[derive(Debug, Default)]
pub(crate) struct NopHooks;

impl DeviceHooks for NopHooks {
    fn reset(&self) -> Result<(), ResetError> {
        Ok(())
    }

    fn set_workaround(&self, _wa: Workaround, _enable: bool) {}
}

/// Emitter that accepts everything without recording it.
#[derive(Debug)]
pub(crate) struct NopEmitter;

impl Emitter for NopEmitter {
    fn emit(&self, _ctx: &EmitCtx<'_>) -> Result<(), EmitError> {
        Ok(())
    }
}
