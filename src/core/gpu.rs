use compact_str::CompactString;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gpu {
    /// Index within the owning node.
    pub id: u32,
    pub total_vram_gb: f64,
    /// VRAM booked by tasks this scheduler placed.
    pub used_vram_gb: f64,
    pub util_pct: f64,
    /// VRAM held by processes the scheduler does not manage.
    pub unmanaged_vram_gb: f64,
    pub zombie: bool,
}

impl Gpu {
    pub fn new(id: u32, total_vram_gb: f64) -> Self {
        Self {
            id,
            total_vram_gb,
            used_vram_gb: 0.0,
            util_pct: 0.0,
            unmanaged_vram_gb: 0.0,
            zombie: false,
        }
    }

    pub fn with_used(mut self, used_vram_gb: f64) -> Self {
        self.used_vram_gb = used_vram_gb;
        self
    }

    pub fn with_unmanaged(mut self, unmanaged_vram_gb: f64) -> Self {
        self.unmanaged_vram_gb = unmanaged_vram_gb;
        self
    }

    /// Never negative.
    pub fn free_vram_gb(&self) -> f64 {
        (self.total_vram_gb - self.used_vram_gb - self.unmanaged_vram_gb).max(0.0)
    }

    pub fn is_busy(&self) -> bool {
        self.used_vram_gb > 0.0
    }

    pub(crate) fn book(&mut self, vram_gb: f64) {
        self.used_vram_gb += vram_gb;
    }

    pub(crate) fn release(&mut self, vram_gb: f64) {
        self.used_vram_gb = (self.used_vram_gb - vram_gb).max(0.0);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: CompactString,
    pub gpus: Vec<Gpu>,
    pub gpu_type: Option<CompactString>,
}

impl Node {
    pub fn new(name: impl Into<CompactString>, gpus: Vec<Gpu>) -> Self {
        Self {
            name: name.into(),
            gpus,
            gpu_type: None,
        }
    }

    pub fn with_gpu_type(mut self, gpu_type: impl Into<CompactString>) -> Self {
        self.gpu_type = Some(gpu_type.into());
        self
    }

    pub fn gpu(&self, id: u32) -> Option<&Gpu> {
        self.gpus.iter().find(|g| g.id == id)
    }

    pub fn gpu_mut(&mut self, id: u32) -> Option<&mut Gpu> {
        self.gpus.iter_mut().find(|g| g.id == id)
    }

    /// A task with no type requirement fits any node.
    pub fn matches_type(&self, required: Option<&str>) -> bool {
        match required {
            None => true,
            Some(required) => self
                .gpu_type
                .as_deref()
                .is_some_and(|t| t.eq_ignore_ascii_case(required)),
        }
    }
}
