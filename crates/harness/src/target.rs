//! Render targets: the browsers and emulated devices a checkpoint is compared on

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, HarnessResult};

/// Kind of render target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Browser,
    DeviceEmulation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    Portrait,
    Landscape,
}

/// Desktop browser families available as render targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrowserType {
    Chrome,
    Firefox,
    Safari,
    Edge,
}

impl BrowserType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrowserType::Chrome => "chrome",
            BrowserType::Firefox => "firefox",
            BrowserType::Safari => "safari",
            BrowserType::Edge => "edge",
        }
    }
}

/// Emulated devices. Dimensions are CSS pixels in portrait orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceName {
    Pixel2,
    Pixel3,
    Nexus7,
    Nexus10,
    IPhoneX,
    IPhone11,
    GalaxyS5,
    IPad,
    IPadPro,
}

impl DeviceName {
    pub const ALL: [DeviceName; 9] = [
        DeviceName::Pixel2,
        DeviceName::Pixel3,
        DeviceName::Nexus7,
        DeviceName::Nexus10,
        DeviceName::IPhoneX,
        DeviceName::IPhone11,
        DeviceName::GalaxyS5,
        DeviceName::IPad,
        DeviceName::IPadPro,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceName::Pixel2 => "Pixel 2",
            DeviceName::Pixel3 => "Pixel 3",
            DeviceName::Nexus7 => "Nexus 7",
            DeviceName::Nexus10 => "Nexus 10",
            DeviceName::IPhoneX => "iPhone X",
            DeviceName::IPhone11 => "iPhone 11",
            DeviceName::GalaxyS5 => "Galaxy S5",
            DeviceName::IPad => "iPad",
            DeviceName::IPadPro => "iPad Pro",
        }
    }

    /// Portrait (width, height)
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            DeviceName::Pixel2 => (411, 731),
            DeviceName::Pixel3 => (393, 786),
            DeviceName::Nexus7 => (600, 960),
            DeviceName::Nexus10 => (800, 1280),
            DeviceName::IPhoneX => (375, 812),
            DeviceName::IPhone11 => (414, 896),
            DeviceName::GalaxyS5 => (360, 640),
            DeviceName::IPad => (768, 1024),
            DeviceName::IPadPro => (1024, 1366),
        }
    }

    /// Look up a device by its display name, ignoring case
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|d| d.as_str().eq_ignore_ascii_case(name))
    }
}

/// Width and height in CSS pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self { width: 1024, height: 768 }
    }
}

impl fmt::Display for Viewport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// One rendering target. Fields are private so every value went through validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TargetDescriptor {
    kind: TargetKind,
    identifier: String,
    width: u32,
    height: u32,
    orientation: Option<Orientation>,
}

impl TargetDescriptor {
    pub fn new(
        kind: TargetKind,
        identifier: impl Into<String>,
        width: u32,
        height: u32,
        orientation: Option<Orientation>,
    ) -> HarnessResult<Self> {
        let identifier = identifier.into();

        if width == 0 || height == 0 {
            return Err(HarnessError::Validation(format!(
                "target '{}' must have a positive size, got {}x{}",
                identifier, width, height
            )));
        }

        let identifier = match kind {
            TargetKind::DeviceEmulation => match DeviceName::from_name(&identifier) {
                Some(device) => device.as_str().to_string(),
                None => {
                    return Err(HarnessError::Validation(format!(
                        "unknown device '{}'",
                        identifier
                    )))
                }
            },
            TargetKind::Browser => identifier,
        };

        Ok(Self {
            kind,
            identifier,
            width,
            height,
            orientation,
        })
    }

    /// A desktop browser at a fixed viewport
    pub fn browser(width: u32, height: u32, browser: BrowserType) -> HarnessResult<Self> {
        Self::new(TargetKind::Browser, browser.as_str(), width, height, None)
    }

    /// An emulated device; landscape swaps the catalog dimensions
    pub fn device(device: DeviceName, orientation: Orientation) -> HarnessResult<Self> {
        let (w, h) = device.dimensions();
        let (width, height) = match orientation {
            Orientation::Portrait => (w, h),
            Orientation::Landscape => (h, w),
        };
        Self::new(
            TargetKind::DeviceEmulation,
            device.as_str(),
            width,
            height,
            Some(orientation),
        )
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn viewport(&self) -> Viewport {
        Viewport::new(self.width, self.height)
    }

    pub fn orientation(&self) -> Option<Orientation> {
        self.orientation
    }

    /// Filesystem-safe key, e.g. `chrome-800x600` or `pixel-2-731x411-landscape`
    pub fn slug(&self) -> String {
        let mut slug = format!(
            "{}-{}x{}",
            self.identifier.to_lowercase().replace(' ', "-"),
            self.width,
            self.height
        );
        if let Some(o) = self.orientation {
            slug.push_str(match o {
                Orientation::Portrait => "-portrait",
                Orientation::Landscape => "-landscape",
            });
        }
        slug
    }
}

impl fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}x{}", self.identifier, self.width, self.height)?;
        if let Some(o) = self.orientation {
            write!(f, " ({:?})", o)?;
        }
        Ok(())
    }
}

/// Deduplicated set of targets, iterated in insertion order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TargetSet(Vec<TargetDescriptor>);

impl TargetSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if an equal target was already present
    pub fn insert(&mut self, target: TargetDescriptor) -> bool {
        if self.0.contains(&target) {
            return false;
        }
        self.0.push(target);
        true
    }

    pub fn contains(&self, target: &TargetDescriptor) -> bool {
        self.0.contains(target)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TargetDescriptor> {
        self.0.iter()
    }
}

impl FromIterator<TargetDescriptor> for TargetSet {
    fn from_iter<I: IntoIterator<Item = TargetDescriptor>>(iter: I) -> Self {
        let mut set = TargetSet::new();
        for t in iter {
            set.insert(t);
        }
        set
    }
}

impl<'a> IntoIterator for &'a TargetSet {
    type Item = &'a TargetDescriptor;
    type IntoIter = std::slice::Iter<'a, TargetDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Where a result was produced: the local run, or one remote target
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderTarget {
    Local,
    Remote(TargetDescriptor),
}

impl fmt::Display for RenderTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderTarget::Local => write!(f, "local"),
            RenderTarget::Remote(t) => write!(f, "{}", t),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(TargetKind::Browser, "chrome", 800, 600, true ; "browser ok")]
    #[test_case(TargetKind::Browser, "firefox", 0, 600, false ; "zero width")]
    #[test_case(TargetKind::Browser, "safari", 1024, 0, false ; "zero height")]
    #[test_case(TargetKind::DeviceEmulation, "Pixel 2", 411, 731, true ; "known device")]
    #[test_case(TargetKind::DeviceEmulation, "nexus 10", 1280, 800, true ; "device name is case insensitive")]
    #[test_case(TargetKind::DeviceEmulation, "Nokia 3310", 84, 48, false ; "unknown device")]
    #[test_case(TargetKind::DeviceEmulation, "Pixel 2", 0, 731, false ; "known device zero width")]
    fn test_target_validation(kind: TargetKind, id: &str, w: u32, h: u32, ok: bool) {
        let result = TargetDescriptor::new(kind, id, w, h, None);
        assert_eq!(result.is_ok(), ok, "{:?}", result);
        if !ok {
            assert!(matches!(result, Err(HarnessError::Validation(_))));
        }
    }

    #[test]
    fn test_device_landscape_swaps_dimensions() {
        let t = TargetDescriptor::device(DeviceName::Nexus10, Orientation::Landscape).unwrap();
        assert_eq!(t.viewport(), Viewport::new(1280, 800));
        assert_eq!(t.slug(), "nexus-10-1280x800-landscape");
    }

    #[test]
    fn test_device_identifier_is_canonical() {
        let typed = TargetDescriptor::new(TargetKind::DeviceEmulation, "nexus 10", 1280, 800, Some(Orientation::Landscape))
            .unwrap();
        let catalog = TargetDescriptor::device(DeviceName::Nexus10, Orientation::Landscape).unwrap();
        assert_eq!(typed.identifier(), DeviceName::Nexus10.as_str());
        assert_eq!(typed, catalog);

        let set: TargetSet = [typed, catalog].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_target_set_dedups() {
        let a = TargetDescriptor::browser(800, 600, BrowserType::Chrome).unwrap();
        let b = TargetDescriptor::browser(800, 600, BrowserType::Firefox).unwrap();

        let mut set = TargetSet::new();
        assert!(set.insert(a.clone()));
        assert!(set.insert(b));
        assert!(!set.insert(a.clone()));
        assert_eq!(set.len(), 2);

        // Same device, different orientation is a distinct target
        let set: TargetSet = [
            TargetDescriptor::device(DeviceName::Pixel2, Orientation::Portrait).unwrap(),
            TargetDescriptor::device(DeviceName::Pixel2, Orientation::Landscape).unwrap(),
            TargetDescriptor::device(DeviceName::Pixel2, Orientation::Portrait).unwrap(),
        ]
        .into_iter()
        .collect();
        assert_eq!(set.len(), 2);
    }
}
