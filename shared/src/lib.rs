//! Types shared by the relay server and the duel client: the JSON wire
//! protocol and the replicated duel state machine.

pub mod duel;
pub mod protocol;
