pub mod message;
pub mod message_buffer;
pub mod net_dest;

pub use message::{clone_message, msg_ref, read_msg, write_msg, Message, MsgKind, MsgRef};
pub use message_buffer::MessageBuffer;
pub use net_dest::{MachineId, MachineKind, NetDest};
