#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    R32Uint,
    R32Float,
    Rgba32Float,
    D32Float,
}

impl PixelFormat {
    /// Number of 32-bit components per texel.
    pub fn components(&self) -> usize {
        match self {
            PixelFormat::R32Uint | PixelFormat::R32Float | PixelFormat::D32Float => 1,
            PixelFormat::Rgba32Float => 4,
        }
    }

    pub fn size(&self) -> usize {
        self.components() * 4
    }

    pub fn is_depth(&self) -> bool {
        matches!(self, PixelFormat::D32Float)
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, PixelFormat::R32Uint)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float32x2,
    Float32x3,
    Float32x4,
}

impl VertexFormat {
    pub fn size(&self) -> usize {
        match self {
            VertexFormat::Float32x2 => 8,
            VertexFormat::Float32x3 => 12,
            VertexFormat::Float32x4 => 16,
        }
    }
}
