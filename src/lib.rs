//! ARMv5TE coprocessor core
//!
//! Runs guest ARM code next to a big-endian primary CPU, sharing its memory
//! bus. Guest code is interpreted or executed from a block translation cache,
//! targeting WebAssembly.

use wasm_bindgen::prelude::*;

pub mod config;
pub mod cpu;
pub mod error;
pub mod memory;
pub mod snapshot;
mod system;

pub use config::CoreConfig;
pub use error::CoreError;
pub use memory::{Bus, SharedMemory};
pub use system::{ArmCore, ExecResult, ExitReason, CYCLES_PER_OPCODE};

/// Initialize panic hook for better error messages in browser console
#[wasm_bindgen(start)]
pub fn init() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

/// Log to browser console
#[cfg(target_arch = "wasm32")]
pub fn log(s: &str) {
    web_sys::console::log_1(&JsValue::from_str(s));
}

#[cfg(target_arch = "wasm32")]
pub fn error(s: &str) {
    web_sys::console::error_1(&JsValue::from_str(s));
}

#[cfg(not(target_arch = "wasm32"))]
pub fn log(s: &str) {
    println!("LOG: {}", s);
}

#[cfg(not(target_arch = "wasm32"))]
pub fn error(s: &str) {
    eprintln!("ERROR: {}", s);
}

/// Helper macro for console logging
#[macro_export]
macro_rules! console_log {
    ($($t:tt)*) => ($crate::log(&format!($($t)*)))
}

#[macro_export]
macro_rules! console_error {
    ($($t:tt)*) => ($crate::error(&format!($($t)*)))
}

fn js_error(e: CoreError) -> JsValue {
    JsValue::from_str(&e.to_string())
}

/// ARM core interface exposed to JavaScript
#[wasm_bindgen]
pub struct Armv5 {
    core: ArmCore<SharedMemory>,
}

#[wasm_bindgen]
impl Armv5 {
    /// Create a core with its own shared RAM of `memory_size_mb`
    #[wasm_bindgen(constructor)]
    pub fn new(memory_size_mb: u32) -> Armv5 {
        console_log!("Creating ARMv5 core with {}MB shared RAM", memory_size_mb);
        Armv5 {
            core: ArmCore::new(SharedMemory::new(memory_size_mb)),
        }
    }

    /// Allocate the translation cache; must succeed before `execute`
    pub fn init(&mut self) -> bool {
        match self.core.init() {
            Ok(()) => true,
            Err(e) => {
                console_error!("ARMv5 init failed: {}", e);
                false
            }
        }
    }

    pub fn deinit(&mut self) {
        self.core.deinit();
    }

    pub fn reset(&mut self) {
        self.core.reset();
    }

    /// Run for a cycle budget, returning the remaining (possibly negative) budget
    pub fn execute(&mut self, cycles: i32) -> i32 {
        self.core.execute(cycles)
    }

    pub fn get_register(&self, index: u8) -> u32 {
        self.core.get_register(index)
    }

    pub fn set_register(&mut self, index: u8, value: u32) {
        self.core.set_register(index, value);
    }

    pub fn get_pc(&self) -> u32 {
        self.core.get_pc()
    }

    /// Whether the last `execute` stopped on a hypercall
    pub fn service_requested(&self) -> bool {
        self.core.service_requested()
    }

    pub fn set_pending_irqs(&mut self, mask: u16) {
        self.core.set_pending_irqs(mask);
    }

    pub fn set_pending_fiqs(&mut self, mask: u16) {
        self.core.set_pending_fiqs(mask);
    }

    /// Size of the fixed-layout save state
    pub fn state_size() -> u32 {
        snapshot::state_size() as u32
    }

    pub fn save_state(&self) -> Result<Vec<u8>, JsValue> {
        let mut buf = vec![0u8; snapshot::state_size()];
        self.core.save_state(&mut buf).map_err(js_error)?;
        Ok(buf)
    }

    pub fn load_state(&mut self, state: &[u8]) -> Result<(), JsValue> {
        self.core.load_state(state).map_err(js_error)
    }

    /// Serialize the CPU state to a binary blob (compressed with Zstd)
    pub fn get_state(&self) -> Result<Vec<u8>, JsValue> {
        self.core.snapshot().to_bytes().map_err(js_error)
    }

    /// Restore the CPU state from a blob produced by `get_state`
    pub fn set_state(&mut self, state: &[u8]) -> Result<(), JsValue> {
        let snapshot = snapshot::CpuSnapshot::from_bytes(state).map_err(js_error)?;
        self.core.restore_snapshot(&snapshot);
        Ok(())
    }

    /// Translate the block at `pc`, returning its instruction buffer offset
    pub fn translate(&mut self, pc: u32) -> Result<u32, JsValue> {
        let entry = self.core.translate(pc).map_err(js_error)?;
        Ok(entry.offset as u32)
    }

    pub fn flush_translations(&mut self) {
        self.core.flush_translations();
    }

    pub fn invalidate_translation(&mut self, index: i32) {
        self.core.invalidate_translation(index);
    }

    /// Slot of the translated block covering `pc`, or -1
    pub fn translation_slot(&self, pc: u32) -> i32 {
        self.core
            .translation_slot(pc)
            .map(|slot| slot as i32)
            .unwrap_or(-1)
    }

    pub fn fix_pc(&mut self) {
        self.core.fix_pc();
    }

    /// Translation cache counters as a plain JS object
    pub fn cache_stats(&self) -> Result<JsValue, JsValue> {
        serde_wasm_bindgen::to_value(&self.core.cache_stats())
            .map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
    }

    /// Copy data into shared RAM
    pub fn load_memory(&mut self, data: &[u8], addr: u32) -> Result<(), JsValue> {
        self.core
            .bus_mut()
            .load_binary(data, addr)
            .map_err(|e| JsValue::from_str(&e))
    }

    pub fn read_memory(&self, addr: u32, size: u32) -> Vec<u8> {
        self.core.bus().read_bytes(addr, size)
    }
}
