pub mod client;
pub mod codec;
pub mod command;
pub mod frame;
pub mod server;

pub use client::{RpcClient, RpcClientConfig};
pub use codec::TransporterCodec;
pub use command::{RpcRequest, StandardRpcResponse};
pub use frame::{Transporter, TransporterHeader};
pub use server::{RpcMethodHandler, RpcServer};
