use std::fmt::{Debug, Display, Formatter};

use bytes::Bytes;

/// The kind of memory a buffer lives in. Channels declare which domains they can move, and a
///  pipe negotiates one channel per domain.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Domain(String);

impl Domain {
    pub const CPU: &'static str = "cpu";
    pub const CUDA: &'static str = "cuda";
    pub const HIP: &'static str = "hip";

    pub fn new(name: impl Into<String>) -> Domain {
        Domain(name.into())
    }

    pub fn cpu() -> Domain {
        Domain::new(Self::CPU)
    }

    pub fn cuda() -> Domain {
        Domain::new(Self::CUDA)
    }

    pub fn hip() -> Domain {
        Domain::new(Self::HIP)
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl Debug for Domain {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for Domain {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Domain {
    fn from(value: &str) -> Self {
        Domain::new(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tensor {
    pub domain: Domain,
    pub data: Bytes,
}

impl Tensor {
    pub fn new(domain: Domain, data: impl Into<Bytes>) -> Tensor {
        Tensor {
            domain,
            data: data.into(),
        }
    }

    pub fn cpu(data: impl Into<Bytes>) -> Tensor {
        Tensor::new(Domain::cpu(), data)
    }
}

/// Opaque metadata plus any number of buffers. Metadata is always carried on the pipe's primary
///  connection, each buffer goes through the channel negotiated for its domain.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub metadata: Bytes,
    pub tensors: Vec<Tensor>,
}

impl Message {
    pub fn new(metadata: impl Into<Bytes>) -> Message {
        Message {
            metadata: metadata.into(),
            tensors: Vec::new(),
        }
    }

    pub fn with_tensor(mut self, tensor: Tensor) -> Message {
        self.tensors.push(tensor);
        self
    }
}
