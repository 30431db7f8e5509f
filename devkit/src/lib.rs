/*!
# Warden DevKit - test doubles for the kernel and agents

- `MockTransport`: records published payloads, simulates inbound messages
- `MessageBuilder`: ready-made wire payloads (register, heartbeat, alert, legacy)
- `test_utils`: temporary registration lists and data directories
*/

pub mod mqtt_stub;
pub mod test_utils;

pub use mqtt_stub::{MessageBuilder, MockTransport, PublishedMessage};
pub use test_utils::{reglist_file, TempDataDir};
