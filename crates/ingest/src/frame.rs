use std::fmt;

/// Identifier of a capture source, unique within one pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceId {
    /// Device index of a live camera.
    Index(u32),
    /// Name derived from a file path or given explicitly in configuration.
    Name(String),
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceId::Index(index) => write!(f, "{}", index),
            SourceId::Name(name) => f.write_str(name),
        }
    }
}

impl From<u32> for SourceId {
    fn from(index: u32) -> Self {
        SourceId::Index(index)
    }
}

impl From<&str> for SourceId {
    fn from(name: &str) -> Self {
        SourceId::Name(name.to_string())
    }
}

impl From<String> for SourceId {
    fn from(name: String) -> Self {
        SourceId::Name(name)
    }
}

/// One decoded RGB8 image.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    sequence: u64,
    data: Vec<u8>,
}

impl Frame {
    pub fn new(width: u32, height: u32, sequence: u64, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            sequence,
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Position of this frame in its source's capture order, starting at 0.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// A payload tagged with the source that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope<P> {
    pub source_id: SourceId,
    pub payload: P,
}

impl<P> Envelope<P> {
    pub fn new(source_id: SourceId, payload: P) -> Self {
        Self { source_id, payload }
    }

    pub fn into_parts(self) -> (SourceId, P) {
        (self.source_id, self.payload)
    }
}
