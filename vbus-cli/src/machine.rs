//! Demo emulator: prints the device map at boot and echoes terminal input.

use std::collections::VecDeque;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use vbus::{DeviceMap, Emulator, Fault, Terminal};

const SIGNATURE: &[u8] = b"VBUS";

/// Persisted part of the demo machine.
#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    boots: u32,
    cycles: u64,
    echoed: u64,
    /// Output not yet accepted by the terminal.
    outbox: VecDeque<u8>,
}

/// A stand-in CPU that exercises the device map instead of executing code.
#[derive(Debug, Default)]
pub struct DemoMachine {
    state: State,
}

impl DemoMachine {
    pub fn new() -> Self {
        Self::default()
    }

    fn print(&mut self, text: &str) {
        self.state.outbox.extend(text.as_bytes());
    }

    fn flush(&mut self, console: &Terminal) {
        let pending = self.state.outbox.make_contiguous();
        let written = console.write(pending);
        self.state.outbox.drain(..written);
    }
}

impl Emulator for DemoMachine {
    fn install(&mut self, map: &DeviceMap) -> Result<(), Fault> {
        self.state.boots += 1;
        let mut banner = format!(
            "vbus demo machine, boot {}, {} device(s)\n",
            self.state.boots,
            map.len()
        );
        for mapping in map.iter() {
            let device = &mapping.device;
            let _ = write!(banner, "  {:<10} {:<8}", device.id().to_string(), device.kind());
            match mapping.base {
                Some(base) => {
                    let _ = write!(banner, " {base:#012x} +{:#x}", mapping.size);
                }
                None => banner.push_str(" unmapped"),
            }
            if !mapping.interrupts.is_empty() {
                let _ = write!(banner, " irq {:?}", mapping.interrupts);
            }
            if let Some(storage) = device.block_storage() {
                let _ = write!(
                    banner,
                    " media {}",
                    if storage.media_present() {
                        format!("{} bytes", storage.capacity())
                    } else {
                        "absent".to_owned()
                    }
                );
            }
            if let Some(rpc) = device.rpc() {
                let _ = write!(banner, " {} {:?}", rpc.type_names().join("/"), rpc.methods());
            }
            banner.push('\n');
        }

        let window = map.window();
        if let Some((memory, offset)) = map.memory_at(window.start) {
            memory.write(offset, SIGNATURE);
            let mut probe = [0u8; SIGNATURE.len()];
            memory.read(offset, &mut probe);
            if probe != SIGNATURE {
                return Err(Fault::new("memory check failed"));
            }
            banner.push_str("memory check ok\n");
        }
        self.print(&banner);
        Ok(())
    }

    fn run(&mut self, cycles: u64, console: &Terminal) -> Result<(), Fault> {
        self.state.cycles += cycles;
        while let Some(byte) = console.read_input() {
            self.state.outbox.push_back(byte);
            self.state.echoed += 1;
        }
        self.flush(console);
        Ok(())
    }

    fn reset(&mut self) {
        let boots = self.state.boots;
        self.state = State {
            boots,
            ..State::default()
        };
    }

    fn save(&self) -> Vec<u8> {
        serde_json::to_vec(&self.state).unwrap_or_default()
    }

    fn restore(&mut self, blob: &[u8]) -> Result<(), Fault> {
        self.state = serde_json::from_slice(blob)
            .map_err(|e| Fault::new(format!("demo machine state: {e}")))?;
        Ok(())
    }

    fn release_scratch(&mut self) {
        self.state.outbox.shrink_to_fit();
    }
}
