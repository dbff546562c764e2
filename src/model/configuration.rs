use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Integer rectangle in hierarchy coordinates, left/top inclusive.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Rect { left, top, right, bottom }
    }

    pub fn width(&self) -> i32 { self.right - self.left }

    pub fn height(&self) -> i32 { self.bottom - self.top }

    pub fn is_empty(&self) -> bool { self.width() <= 0 || self.height() <= 0 }

    /// Whether `other` lies entirely within `self`. An empty rect contains
    /// nothing.
    pub fn contains(&self, other: &Rect) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.left <= other.left
            && self.top <= other.top
            && self.right >= other.right
            && self.bottom >= other.bottom
    }
}

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowingMode {
    #[default]
    Undefined,
    Fullscreen,
    MultiWindow,
    Freeform,
    Pinned,
}

impl WindowingMode {
    pub fn in_multi_window(self) -> bool {
        matches!(self, WindowingMode::MultiWindow | WindowingMode::Freeform)
    }

    pub fn is_pinned(self) -> bool { self == WindowingMode::Pinned }
}

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutDirection {
    #[default]
    Ltr,
    Rtl,
}

bitflags! {
    /// Which top-level configuration fields a change touches.
    #[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ConfigMask: u32 {
        const WINDOW_CONFIGURATION = 1 << 0;
        const SCREEN_SIZE = 1 << 1;
        const SMALLEST_SCREEN_SIZE = 1 << 2;
        const LAYOUT_DIRECTION = 1 << 3;
        const DENSITY = 1 << 4;
    }
}

bitflags! {
    /// Which window-configuration fields a change touches.
    #[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct WindowConfigMask: u32 {
        const BOUNDS = 1 << 0;
        const APP_BOUNDS = 1 << 1;
        const WINDOWING_MODE = 1 << 2;
        const ALWAYS_ON_TOP = 1 << 3;
    }
}

/// Configuration fields organizers are allowed to control. Incoming changes
/// are filtered to these; differences outside them never reach an organizer.
pub const CONTROLLABLE_CONFIGS: ConfigMask = ConfigMask::WINDOW_CONFIGURATION
    .union(ConfigMask::SCREEN_SIZE)
    .union(ConfigMask::SMALLEST_SCREEN_SIZE)
    .union(ConfigMask::LAYOUT_DIRECTION);

pub const CONTROLLABLE_WINDOW_CONFIGS: WindowConfigMask =
    WindowConfigMask::BOUNDS.union(WindowConfigMask::APP_BOUNDS);

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfiguration {
    pub bounds: Rect,
    pub app_bounds: Option<Rect>,
    pub windowing_mode: WindowingMode,
    pub always_on_top: bool,
}

impl WindowConfiguration {
    pub fn diff(&self, other: &WindowConfiguration) -> WindowConfigMask {
        let mut mask = WindowConfigMask::empty();
        if self.bounds != other.bounds {
            mask |= WindowConfigMask::BOUNDS;
        }
        if self.app_bounds != other.app_bounds {
            mask |= WindowConfigMask::APP_BOUNDS;
        }
        if self.windowing_mode != other.windowing_mode {
            mask |= WindowConfigMask::WINDOWING_MODE;
        }
        if self.always_on_top != other.always_on_top {
            mask |= WindowConfigMask::ALWAYS_ON_TOP;
        }
        mask
    }

    pub fn set_to(&mut self, other: &WindowConfiguration, mask: WindowConfigMask) {
        if mask.contains(WindowConfigMask::BOUNDS) {
            self.bounds = other.bounds;
        }
        if mask.contains(WindowConfigMask::APP_BOUNDS) {
            self.app_bounds = other.app_bounds;
        }
        if mask.contains(WindowConfigMask::WINDOWING_MODE) {
            self.windowing_mode = other.windowing_mode;
        }
        if mask.contains(WindowConfigMask::ALWAYS_ON_TOP) {
            self.always_on_top = other.always_on_top;
        }
    }
}

/// The externally visible configuration of a container.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub screen_width_dp: i32,
    pub screen_height_dp: i32,
    pub smallest_screen_width_dp: i32,
    pub layout_direction: LayoutDirection,
    pub density_dpi: i32,
    pub window: WindowConfiguration,
}

impl Configuration {
    pub fn diff(&self, other: &Configuration) -> ConfigMask {
        let mut mask = ConfigMask::empty();
        if self.window != other.window {
            mask |= ConfigMask::WINDOW_CONFIGURATION;
        }
        if self.screen_width_dp != other.screen_width_dp
            || self.screen_height_dp != other.screen_height_dp
        {
            mask |= ConfigMask::SCREEN_SIZE;
        }
        if self.smallest_screen_width_dp != other.smallest_screen_width_dp {
            mask |= ConfigMask::SMALLEST_SCREEN_SIZE;
        }
        if self.layout_direction != other.layout_direction {
            mask |= ConfigMask::LAYOUT_DIRECTION;
        }
        if self.density_dpi != other.density_dpi {
            mask |= ConfigMask::DENSITY;
        }
        mask
    }

    /// Copies the fields selected by the masks from `other` into `self`.
    pub fn set_to(&mut self, other: &Configuration, mask: ConfigMask, window_mask: WindowConfigMask) {
        if mask.contains(ConfigMask::WINDOW_CONFIGURATION) {
            self.window.set_to(&other.window, window_mask);
        }
        if mask.contains(ConfigMask::SCREEN_SIZE) {
            self.screen_width_dp = other.screen_width_dp;
            self.screen_height_dp = other.screen_height_dp;
        }
        if mask.contains(ConfigMask::SMALLEST_SCREEN_SIZE) {
            self.smallest_screen_width_dp = other.smallest_screen_width_dp;
        }
        if mask.contains(ConfigMask::LAYOUT_DIRECTION) {
            self.layout_direction = other.layout_direction;
        }
        if mask.contains(ConfigMask::DENSITY) {
            self.density_dpi = other.density_dpi;
        }
    }
}

/// Whether two configurations are equal as far as an organizer is concerned.
///
/// Differences confined to fields outside the controllable masks are
/// invisible to organizers and must not trigger an info-changed event.
pub fn configurations_equal_for_organizer(
    new_config: &Configuration,
    old_config: Option<&Configuration>,
) -> bool {
    let Some(old_config) = old_config else {
        return false;
    };
    let mut changes = new_config.diff(old_config);
    if changes.contains(ConfigMask::WINDOW_CONFIGURATION) {
        let window_changes = new_config.window.diff(&old_config.window);
        if (window_changes & CONTROLLABLE_WINDOW_CONFIGS).is_empty() {
            changes -= ConfigMask::WINDOW_CONFIGURATION;
        }
    }
    (changes & CONTROLLABLE_CONFIGS).is_empty()
}
