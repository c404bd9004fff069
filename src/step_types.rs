//! Step definitions for macros.
//!
//! A [`MacroStep`] carries the fields every step shares and a [`StepKind`]
//! payload. On disk the payload is flattened into the step object and
//! discriminated by `step_type`.

use crate::recovery::RecoveryHints;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorHandling {
    #[default]
    Stop,
    Continue,
    Retry,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

/// Screen rectangle in logical pixels. Serialized as `[x, y, width, height]`.
///
/// `x`/`y` may be negative on multi-monitor layouts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<i64>", into = "[i64; 4]")]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {}x{})", self.x, self.y, self.width, self.height)
    }
}

impl TryFrom<Vec<i64>> for Region {
    type Error = String;

    fn try_from(values: Vec<i64>) -> Result<Self, Self::Error> {
        if values.len() != 4 {
            return Err(format!(
                "region must be [x, y, width, height], got {} values",
                values.len()
            ));
        }
        let x = i32::try_from(values[0]).map_err(|_| "region x out of range".to_string())?;
        let y = i32::try_from(values[1]).map_err(|_| "region y out of range".to_string())?;
        let width =
            u32::try_from(values[2]).map_err(|_| "region width must be >= 0".to_string())?;
        let height =
            u32::try_from(values[3]).map_err(|_| "region height must be >= 0".to_string())?;
        Ok(Region::new(x, y, width, height))
    }
}

impl From<Region> for [i64; 4] {
    fn from(r: Region) -> Self {
        [r.x as i64, r.y as i64, r.width as i64, r.height as i64]
    }
}

fn new_step_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn yes() -> bool {
    true
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn one() -> u32 {
    1
}

fn one_second() -> f64 {
    1.0
}

fn ten_seconds() -> f64 {
    10.0
}

fn image_confidence() -> f64 {
    0.9
}

// The two text-search families keep their historical defaults.
fn text_confidence() -> f64 {
    0.5
}

fn dynamic_text_confidence() -> f64 {
    0.7
}

/// One node in the macro tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MacroStep {
    #[serde(default = "new_step_id")]
    pub step_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default = "yes")]
    pub enabled: bool,
    #[serde(default)]
    pub error_handling: ErrorHandling,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "RecoveryHints::is_empty")]
    pub recovery: RecoveryHints,
    #[serde(flatten)]
    pub kind: StepKind,
}

impl MacroStep {
    /// Creates an enabled step with a fresh id and the `stop` policy.
    pub fn new(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            step_id: new_step_id(),
            name: name.into(),
            description: String::new(),
            enabled: true,
            error_handling: ErrorHandling::Stop,
            retry_count: 0,
            recovery: RecoveryHints::default(),
            kind,
        }
    }

    pub fn with_id(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = step_id.into();
        self
    }

    pub fn with_policy(mut self, error_handling: ErrorHandling, retry_count: u32) -> Self {
        self.error_handling = error_handling;
        self.retry_count = retry_count;
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryHints) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn step_type(&self) -> &'static str {
        self.kind.type_name()
    }

    /// Child step lists owned by this step, in declaration order.
    pub fn children(&self) -> Vec<&[MacroStep]> {
        match &self.kind {
            StepKind::IfCondition(s) => vec![&s.true_steps, &s.false_steps],
            StepKind::Loop(s) => vec![&s.steps],
            _ => Vec::new(),
        }
    }

    /// Appends every configuration problem of this step (not its children) to `issues`.
    pub(crate) fn validate_into(&self, path: &str, issues: &mut Vec<String>) {
        let mut push = |msg: &str| {
            issues.push(format!("Step {} ({}): {}", path, self.name, msg));
        };
        match &self.kind {
            StepKind::MouseClick(s) => {
                if s.clicks < 1 {
                    push("click count must be at least 1");
                }
                if s.interval < 0.0 {
                    push("interval must be non-negative");
                }
            }
            StepKind::MouseMove(s) => {
                if s.duration < 0.0 {
                    push("duration must be non-negative");
                }
            }
            StepKind::MouseDrag(s) => {
                if s.duration < 0.0 {
                    push("duration must be non-negative");
                }
            }
            StepKind::MouseScroll(s) => {
                if s.clicks == 0 {
                    push("scroll amount cannot be zero");
                }
                if s.x.is_some() != s.y.is_some() {
                    push("scroll position needs both x and y");
                }
            }
            StepKind::KeyboardType(s) => {
                if s.text.is_empty() {
                    push("text cannot be empty");
                }
                if s.interval < 0.0 {
                    push("interval must be non-negative");
                }
            }
            StepKind::KeyboardHotkey(s) => {
                if s.keys.is_empty() {
                    push("at least one key must be specified");
                }
            }
            StepKind::WaitTime(s) => {
                if !(s.seconds >= 0.0) {
                    push("wait time must be non-negative");
                }
            }
            StepKind::WaitImage(s) => {
                if s.image_path.is_empty() {
                    push("image path cannot be empty");
                }
                if !(s.timeout > 0.0) {
                    push("timeout must be positive");
                }
                check_confidence(s.confidence, &mut push);
            }
            StepKind::Screenshot(_) => {}
            StepKind::ImageSearch(s) => {
                if s.image_path.is_empty() {
                    push("image path cannot be empty");
                }
                check_confidence(s.confidence, &mut push);
            }
            StepKind::TextSearch(s) => {
                if s.search_text.is_empty() && s.excel_column.is_none() {
                    push("either search text or excel column must be specified");
                }
                check_confidence(s.confidence, &mut push);
            }
            StepKind::DynamicTextSearch(s) => {
                if s.search_text.is_empty() {
                    push("search text cannot be empty");
                }
                check_confidence(s.confidence_threshold, &mut push);
            }
            StepKind::IfCondition(s) => {
                let v = &s.condition_value;
                match s.condition_type {
                    ConditionType::ImageExists => {
                        if v.image_path.is_empty() {
                            push("image path must be specified for image_exists condition");
                        }
                    }
                    ConditionType::TextExists => {
                        if v.text.is_empty() {
                            push("text must be specified for text_exists condition");
                        }
                    }
                    ConditionType::VariableNotEmpty => {
                        if v.variable.is_empty() {
                            push("variable name must be specified");
                        }
                    }
                    _ => {
                        if v.variable.is_empty() {
                            push("variable name must be specified");
                        }
                        if v.compare_value.is_empty() {
                            push("comparison value must be specified");
                        }
                    }
                }
                if let Some(c) = v.confidence {
                    check_confidence(c, &mut push);
                }
            }
            StepKind::Loop(s) => {
                if s.steps.is_empty() {
                    push("loop must contain at least one step");
                }
                match s.loop_type {
                    LoopType::Count if s.loop_count < 1 => {
                        push("loop count must be at least 1");
                    }
                    LoopType::WhileImage if !contains_image_lookup(&s.steps) => {
                        push("while_image loop needs an image step among its children");
                    }
                    LoopType::WhileImage if s.max_iterations == Some(0) => {
                        push("max_iterations must be at least 1");
                    }
                    _ => {}
                }
            }
        }
    }
}

fn check_confidence(value: f64, push: &mut impl FnMut(&str)) {
    if !(0.0..=1.0).contains(&value) {
        push("confidence must be between 0 and 1");
    }
}

/// True when any step in `steps` (recursively) looks for an image on screen.
pub fn contains_image_lookup(steps: &[MacroStep]) -> bool {
    steps.iter().any(|step| match &step.kind {
        StepKind::ImageSearch(_) | StepKind::WaitImage(_) => true,
        _ => step.children().into_iter().any(contains_image_lookup),
    })
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step_type", rename_all = "snake_case")]
pub enum StepKind {
    MouseClick(MouseClickStep),
    MouseMove(MouseMoveStep),
    MouseDrag(MouseDragStep),
    MouseScroll(MouseScrollStep),
    KeyboardType(KeyboardTypeStep),
    KeyboardHotkey(KeyboardHotkeyStep),
    WaitTime(WaitTimeStep),
    WaitImage(WaitImageStep),
    Screenshot(ScreenshotStep),
    ImageSearch(ImageSearchStep),
    #[serde(alias = "ocr_text")]
    TextSearch(TextSearchStep),
    DynamicTextSearch(DynamicTextSearchStep),
    IfCondition(IfConditionStep),
    Loop(LoopStep),
}

impl StepKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            StepKind::MouseClick(_) => "mouse_click",
            StepKind::MouseMove(_) => "mouse_move",
            StepKind::MouseDrag(_) => "mouse_drag",
            StepKind::MouseScroll(_) => "mouse_scroll",
            StepKind::KeyboardType(_) => "keyboard_type",
            StepKind::KeyboardHotkey(_) => "keyboard_hotkey",
            StepKind::WaitTime(_) => "wait_time",
            StepKind::WaitImage(_) => "wait_image",
            StepKind::Screenshot(_) => "screenshot",
            StepKind::ImageSearch(_) => "image_search",
            StepKind::TextSearch(_) => "text_search",
            StepKind::DynamicTextSearch(_) => "dynamic_text_search",
            StepKind::IfCondition(_) => "if_condition",
            StepKind::Loop(_) => "loop",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MouseClickStep {
    pub x: i32,
    pub y: i32,
    #[serde(default)]
    pub button: MouseButton,
    #[serde(default = "one")]
    pub clicks: u32,
    /// Seconds between clicks.
    #[serde(default)]
    pub interval: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MouseMoveStep {
    pub x: i32,
    pub y: i32,
    #[serde(default)]
    pub duration: f64,
}

/// Presses `button` at the current cursor position and releases it at `(x, y)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MouseDragStep {
    pub x: i32,
    pub y: i32,
    #[serde(default)]
    pub button: MouseButton,
    #[serde(default)]
    pub duration: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MouseScrollStep {
    /// Wheel notches; positive scrolls up.
    pub clicks: i32,
    /// Cursor position to scroll at; the current position when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<i32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyboardTypeStep {
    pub text: String,
    #[serde(default)]
    pub interval: f64,
    #[serde(default = "yes")]
    pub use_variables: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyboardHotkeyStep {
    pub keys: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WaitTimeStep {
    #[serde(default = "one_second")]
    pub seconds: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WaitImageStep {
    pub image_path: String,
    #[serde(default = "ten_seconds")]
    pub timeout: f64,
    #[serde(default = "image_confidence")]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScreenshotStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,
    /// Output path; supports variable tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_path: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageSearchStep {
    pub image_path: String,
    #[serde(default = "image_confidence")]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,
    #[serde(default = "yes", alias = "click_after_find")]
    pub click_on_found: bool,
    #[serde(default)]
    pub click_offset: (i32, i32),
    #[serde(default, skip_serializing_if = "is_false")]
    pub double_click: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_found: Option<MatchAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_not_found: Option<MatchAction>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TextSearchStep {
    #[serde(default)]
    pub search_text: String,
    /// Row column whose value is searched for when `search_text` is empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excel_column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub exact_match: bool,
    #[serde(default = "text_confidence")]
    pub confidence: f64,
    #[serde(default = "yes", alias = "click_after_find")]
    pub click_on_found: bool,
    #[serde(default)]
    pub click_offset: (i32, i32),
    #[serde(default, skip_serializing_if = "is_false")]
    pub double_click: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_found: Option<MatchAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_not_found: Option<MatchAction>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DynamicTextSearchStep {
    pub search_text: String,
    #[serde(default, alias = "region", skip_serializing_if = "Option::is_none")]
    pub search_region: Option<Region>,
    #[serde(default = "dynamic_text_confidence")]
    pub confidence_threshold: f64,
    #[serde(default = "yes")]
    pub click_on_found: bool,
    #[serde(default)]
    pub click_offset: (i32, i32),
    #[serde(default, skip_serializing_if = "is_false")]
    pub double_click: bool,
    #[serde(default = "yes")]
    pub fail_if_not_found: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub mask_in_logs: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_found: Option<MatchAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_not_found: Option<MatchAction>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    ImageExists,
    TextExists,
    #[serde(alias = "equals")]
    VariableEquals,
    #[serde(alias = "not_equals")]
    VariableNotEquals,
    #[serde(alias = "contains")]
    VariableContains,
    #[serde(alias = "greater")]
    VariableGreater,
    #[serde(alias = "less")]
    VariableLess,
    #[serde(alias = "not_empty")]
    VariableNotEmpty,
}

/// Parameters of an `IfCondition`; which fields matter depends on the condition type.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionValue {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub variable: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub compare_value: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub exact_match: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IfConditionStep {
    pub condition_type: ConditionType,
    #[serde(default)]
    pub condition_value: ConditionValue,
    #[serde(default)]
    pub true_steps: Vec<MacroStep>,
    #[serde(default)]
    pub false_steps: Vec<MacroStep>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopType {
    #[default]
    Count,
    WhileImage,
    /// Marks the body as per-row; rows are iterated by the engine, not the loop.
    ForEachRow,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoopStep {
    #[serde(default)]
    pub loop_type: LoopType,
    #[serde(default = "one")]
    pub loop_count: u32,
    /// Guard for `while_image`; falls back to the configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub steps: Vec<MacroStep>,
}

/// Action run when a search step finds (or fails to find) its target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "params", rename_all = "snake_case")]
pub enum MatchAction {
    Click(PointerParams),
    DoubleClick(PointerParams),
    RightClick(PointerParams),
    Move(PointerParams),
    Type(TypeParams),
    Hotkey(HotkeyParams),
    Wait(WaitParams),
    Continue,
    Fail(FailParams),
}

/// Absolute `x`/`y` win over the match centre; offsets apply to either.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PointerParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<i32>,
    #[serde(default)]
    pub offset_x: i32,
    #[serde(default)]
    pub offset_y: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeParams {
    pub text: String,
    #[serde(default)]
    pub interval: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HotkeyParams {
    pub keys: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WaitParams {
    pub seconds: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FailParams {
    #[serde(default)]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_serializes_as_array() {
        let json = serde_json::to_string(&Region::new(-1920, 0, 800, 600)).unwrap();
        assert_eq!(json, "[-1920,0,800,600]");
        let back: Region = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Region::new(-1920, 0, 800, 600));
        assert!(serde_json::from_str::<Region>("[1,2,3]").is_err());
        assert!(serde_json::from_str::<Region>("[0,0,-5,10]").is_err());
    }

    #[test]
    fn legacy_fields_are_accepted() {
        let step: MacroStep = serde_json::from_value(serde_json::json!({
            "step_id": "s1",
            "step_type": "ocr_text",
            "name": "find name",
            "search_text": "{{name}}",
            "click_after_find": false
        }))
        .unwrap();
        match step.kind {
            StepKind::TextSearch(ref t) => {
                assert!(!t.click_on_found);
                assert_eq!(t.confidence, 0.5);
            }
            other => panic!("unexpected kind {:?}", other),
        }
        assert!(step.enabled);
        assert_eq!(step.error_handling, ErrorHandling::Stop);
    }

    #[test]
    fn drag_and_scroll_parse_and_validate() {
        let drag: MacroStep = serde_json::from_value(serde_json::json!({
            "step_type": "mouse_drag", "name": "drag", "x": 10, "y": 20
        }))
        .unwrap();
        assert_eq!(
            drag.kind,
            StepKind::MouseDrag(MouseDragStep {
                x: 10,
                y: 20,
                button: MouseButton::Left,
                duration: 0.0,
            })
        );

        let scroll: MacroStep = serde_json::from_value(serde_json::json!({
            "step_type": "mouse_scroll", "name": "wheel", "clicks": 0, "x": 5
        }))
        .unwrap();
        let mut issues = Vec::new();
        scroll.validate_into("1", &mut issues);
        assert_eq!(issues.len(), 2);
        assert!(issues[0].contains("cannot be zero"));
    }

    #[test]
    fn dynamic_text_search_keeps_its_own_default_confidence() {
        let step: MacroStep = serde_json::from_value(serde_json::json!({
            "step_type": "dynamic_text_search",
            "search_text": "OK"
        }))
        .unwrap();
        match step.kind {
            StepKind::DynamicTextSearch(d) => {
                assert_eq!(d.confidence_threshold, 0.7);
                assert!(d.fail_if_not_found);
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn match_action_uses_action_and_params() {
        let action: MatchAction =
            serde_json::from_str(r#"{"action":"type","params":{"text":"x"}}"#).unwrap();
        assert_eq!(
            action,
            MatchAction::Type(TypeParams {
                text: "x".into(),
                interval: 0.0
            })
        );
        let cont: MatchAction = serde_json::from_str(r#"{"action":"continue"}"#).unwrap();
        assert_eq!(cont, MatchAction::Continue);
    }

    #[test]
    fn condition_aliases() {
        let c: ConditionType = serde_json::from_str("\"not_empty\"").unwrap();
        assert_eq!(c, ConditionType::VariableNotEmpty);
        let c: ConditionType = serde_json::from_str("\"variable_greater\"").unwrap();
        assert_eq!(c, ConditionType::VariableGreater);
    }

    #[test]
    fn image_target_is_found_in_nested_children() {
        let lookup = MacroStep::new(
            "lookup",
            StepKind::ImageSearch(ImageSearchStep {
                image_path: "ok.png".into(),
                confidence: 0.9,
                region: None,
                click_on_found: false,
                click_offset: (0, 0),
                double_click: false,
                on_found: None,
                on_not_found: None,
            }),
        );
        let branch = MacroStep::new(
            "branch",
            StepKind::IfCondition(IfConditionStep {
                condition_type: ConditionType::VariableNotEmpty,
                condition_value: ConditionValue {
                    variable: "v".into(),
                    ..Default::default()
                },
                true_steps: vec![lookup],
                false_steps: vec![],
            }),
        );
        assert!(contains_image_lookup(&[branch]));
        assert!(!contains_image_lookup(&[]));
    }
}
