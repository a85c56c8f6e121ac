use std::time::Duration;

/// Hardware engine classes served by this engine.
///
/// Dispatch over the class (watchdog timeouts, in-flight counter selection,
/// TMZ capability) goes through a small per-variant capability table rather
/// than function-pointer polymorphism.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EngineClass {
    Gfx,
    Compute,
    Sdma,
}

/// Static capabilities of one engine class.
#[derive(Debug)]
pub struct EngineCaps {
    pub name: &'static str,
    pub supports_tmz: bool,
    /// A ring of this class with in-flight work and no fence progress for
    /// this long is considered hung.
    pub hang_timeout: Duration,
}

static GFX_CAPS: EngineCaps = EngineCaps {
    name: "gfx",
    supports_tmz: true,
    hang_timeout: Duration::from_secs(10),
};

static COMPUTE_CAPS: EngineCaps = EngineCaps {
    name: "compute",
    supports_tmz: true,
    // Long-running compute dispatches are legitimate; give them more rope.
    hang_timeout: Duration::from_secs(60),
};

static SDMA_CAPS: EngineCaps = EngineCaps {
    name: "sdma",
    supports_tmz: false,
    hang_timeout: Duration::from_secs(10),
};

impl EngineClass {
    pub const COUNT: usize = 3;
    pub const ALL: [EngineClass; Self::COUNT] =
        [EngineClass::Gfx, EngineClass::Compute, EngineClass::Sdma];

    pub fn index(self) -> usize {
        match self {
            EngineClass::Gfx => 0,
            EngineClass::Compute => 1,
            EngineClass::Sdma => 2,
        }
    }

    pub fn caps(self) -> &'static EngineCaps {
        match self {
            EngineClass::Gfx => &GFX_CAPS,
            EngineClass::Compute => &COMPUTE_CAPS,
            EngineClass::Sdma => &SDMA_CAPS,
        }
    }
}

/// Position of a hardware queue within its engine block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueCoords {
    pub pipe: u32,
    pub queue: u32,
}
