use std::collections::BTreeMap;

use crashgate_contracts::ParamErrors;
use crashgate_contracts::canonical;

pub const REQUIRED_MESSAGE: &str = "This field is required.";

/// Semantic type of one declared parameter. Enum options are fixed at
/// registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Text,
    Number,
    Date,
    Boolean,
    Flag,
    Enum(&'static [&'static str]),
    CrashId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    Contains,
    StartsWith,
    EndsWith,
    IsTrue,
    IsNull,
    GreaterOrEqual,
    LessOrEqual,
    Greater,
    Less,
}

impl Operator {
    pub fn symbol(self) -> &'static str {
        match self {
            Operator::Equals => "",
            Operator::Contains => "~",
            Operator::StartsWith => "^",
            Operator::EndsWith => "$",
            Operator::IsTrue => "__true__",
            Operator::IsNull => "__null__",
            Operator::GreaterOrEqual => ">=",
            Operator::LessOrEqual => "<=",
            Operator::Greater => ">",
            Operator::Less => "<",
        }
    }
}

/// Per-type operator vocabulary. Values are checked against this table,
/// never against scattered conditionals.
pub fn allowed_operators(kind: ParamKind) -> &'static [Operator] {
    use Operator::*;
    match kind {
        ParamKind::Text => &[Equals, Contains, StartsWith, EndsWith, IsTrue, IsNull],
        ParamKind::Number => &[Equals, GreaterOrEqual, LessOrEqual, Greater, Less],
        ParamKind::Date => &[GreaterOrEqual, LessOrEqual, Greater, Less],
        ParamKind::Boolean => &[IsTrue],
        ParamKind::Flag => &[IsNull],
        ParamKind::Enum(_) => &[Equals],
        ParamKind::CrashId => &[Equals],
    }
}

/// One declared parameter of a model's schema.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
    pub multiple: bool,
    pub default: Option<&'static str>,
}

impl ParamSpec {
    fn new(name: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            kind,
            required: false,
            multiple: false,
            default: None,
        }
    }

    pub fn text(name: &'static str) -> Self {
        Self::new(name, ParamKind::Text)
    }

    pub fn number(name: &'static str) -> Self {
        Self::new(name, ParamKind::Number)
    }

    pub fn date(name: &'static str) -> Self {
        Self::new(name, ParamKind::Date)
    }

    pub fn boolean(name: &'static str) -> Self {
        Self::new(name, ParamKind::Boolean)
    }

    pub fn flag(name: &'static str) -> Self {
        Self::new(name, ParamKind::Flag)
    }

    pub fn enumeration(name: &'static str, options: &'static [&'static str]) -> Self {
        Self::new(name, ParamKind::Enum(options))
    }

    pub fn crash_id(name: &'static str) -> Self {
        Self::new(name, ParamKind::CrashId)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn multiple(mut self) -> Self {
        self.multiple = true;
        self
    }

    pub fn default_value(mut self, value: &'static str) -> Self {
        self.default = Some(value);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Text(String),
    Number(f64),
    Date(String),
}

impl Literal {
    pub fn render(&self) -> String {
        match self {
            Literal::Text(s) => s.clone(),
            Literal::Date(s) => s.clone(),
            Literal::Number(n) => {
                if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
                    format!("{}", *n as i64)
                } else {
                    format!("{}", n)
                }
            }
        }
    }
}

/// One parsed `[operator-prefix] literal` value. Sentinel operators
/// (`__true__`, `__null__`) carry no literal.
#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    pub operator: Operator,
    pub value: Option<Literal>,
}

impl Constraint {
    pub fn text(&self) -> Option<&str> {
        match &self.value {
            Some(Literal::Text(s)) | Some(Literal::Date(s)) => Some(s),
            _ => None,
        }
    }

    pub fn number(&self) -> Option<f64> {
        match &self.value {
            Some(Literal::Number(n)) => Some(*n),
            _ => None,
        }
    }

    /// Wire form: operator prefix plus literal, sentinels alone.
    pub fn render(&self) -> String {
        match (self.operator, &self.value) {
            (Operator::IsTrue, _) | (Operator::IsNull, _) => self.operator.symbol().to_string(),
            (operator, Some(literal)) => format!("{}{}", operator.symbol(), literal.render()),
            (operator, None) => operator.symbol().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Single(Constraint),
    Many(Vec<Constraint>),
}

impl ParamValue {
    pub fn constraints(&self) -> &[Constraint] {
        match self {
            ParamValue::Single(constraint) => std::slice::from_ref(constraint),
            ParamValue::Many(constraints) => constraints,
        }
    }

    /// Drop constraints failing the predicate; list values only.
    pub fn retain(&mut self, mut keep: impl FnMut(&Constraint) -> bool) {
        if let ParamValue::Many(constraints) = self {
            constraints.retain(|c| keep(c));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.constraints().is_empty()
    }

    pub fn first_text(&self) -> Option<&str> {
        self.constraints().first().and_then(|c| c.text())
    }

    pub fn first_number(&self) -> Option<f64> {
        self.constraints().first().and_then(|c| c.number())
    }
}

/// Validated, coerced parameters for one invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidatedParams(BTreeMap<String, ParamValue>);

impl ValidatedParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn insert(&mut self, name: &str, value: ParamValue) {
        self.0.insert(name.to_string(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<ParamValue> {
        self.0.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut ParamValue)> {
        self.0.iter_mut()
    }

    pub fn first_text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.first_text())
    }

    pub fn first_number(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(|v| v.first_number())
    }

    pub fn texts(&self, name: &str) -> Vec<String> {
        self.get(name)
            .map(|value| {
                value
                    .constraints()
                    .iter()
                    .filter_map(|c| c.text())
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn numbers(&self, name: &str) -> Vec<f64> {
        self.get(name)
            .map(|value| {
                value
                    .constraints()
                    .iter()
                    .filter_map(|c| c.number())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Validate raw key/value pairs against a schema. List parameters accept
/// repeated keys and comma-joined values. Errors accumulate per parameter;
/// a single bad value never hides the others.
pub fn validate(schema: &[ParamSpec], raw: &[(String, String)]) -> Result<ValidatedParams, ParamErrors> {
    let mut grouped: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (name, value) in raw {
        grouped.entry(name.as_str()).or_default().push(value.as_str());
    }

    let mut out = ValidatedParams::new();
    let mut errors = ParamErrors::new();

    for spec in schema {
        let mut field_errors: Vec<String> = Vec::new();
        let mut pieces: Vec<&str> = Vec::new();

        for value in grouped.get(spec.name).map(Vec::as_slice).unwrap_or(&[]) {
            if value.contains('\0') {
                field_errors.push("Null characters are not allowed.".to_string());
                continue;
            }

            let value = value.trim();
            if value.is_empty() {
                continue;
            }

            if spec.multiple {
                for piece in value.split(',') {
                    let piece = piece.trim();
                    if piece.is_empty() {
                        field_errors.push("Malformed list value.".to_string());
                    } else {
                        pieces.push(piece);
                    }
                }
            } else {
                pieces.push(value);
            }
        }

        if !spec.multiple && pieces.len() > 1 {
            field_errors.push("Expected a single value.".to_string());
        }

        if pieces.is_empty() && field_errors.is_empty() {
            if let Some(default) = spec.default {
                pieces.push(default);
            }
        }

        let mut constraints = Vec::with_capacity(pieces.len());
        for piece in &pieces {
            match parse_constraint(spec, piece) {
                Ok(constraint) => constraints.push(constraint),
                Err(message) => field_errors.push(message),
            }
        }

        if !field_errors.is_empty() {
            errors.insert(spec.name.to_string(), field_errors);
            continue;
        }

        if constraints.is_empty() {
            // An empty optional list means "no constraint"; a required one
            // is missing input.
            if spec.required {
                errors.insert(spec.name.to_string(), vec![REQUIRED_MESSAGE.to_string()]);
            }
            continue;
        }

        let value = if spec.multiple {
            ParamValue::Many(constraints)
        } else {
            ParamValue::Single(constraints.remove(0))
        };
        out.insert(spec.name, value);
    }

    if errors.is_empty() { Ok(out) } else { Err(errors) }
}

fn parse_constraint(spec: &ParamSpec, piece: &str) -> Result<Constraint, String> {
    let allowed = allowed_operators(spec.kind);

    let (operator, rest) = if piece == "__true__" {
        (Operator::IsTrue, "")
    } else if piece == "__null__" {
        (Operator::IsNull, "")
    } else if let Some(rest) = piece.strip_prefix(">=") {
        (Operator::GreaterOrEqual, rest)
    } else if let Some(rest) = piece.strip_prefix("<=") {
        (Operator::LessOrEqual, rest)
    } else if let Some(rest) = piece.strip_prefix('>') {
        (Operator::Greater, rest)
    } else if let Some(rest) = piece.strip_prefix('<') {
        (Operator::Less, rest)
    } else if let Some(rest) = piece.strip_prefix('~') {
        (Operator::Contains, rest)
    } else if let Some(rest) = piece.strip_prefix('^') {
        (Operator::StartsWith, rest)
    } else if let Some(rest) = piece.strip_prefix('$') {
        (Operator::EndsWith, rest)
    } else {
        (Operator::Equals, piece)
    };

    if !allowed.contains(&operator) {
        return Err(format!(
            "Operator `{}` is not allowed for this field.",
            display_operator(operator)
        ));
    }

    if matches!(operator, Operator::IsTrue | Operator::IsNull) {
        return Ok(Constraint {
            operator,
            value: None,
        });
    }

    let rest = rest.trim();
    if rest.is_empty() {
        return Err("Missing value.".to_string());
    }

    let literal = match spec.kind {
        ParamKind::Text => Literal::Text(rest.to_string()),
        ParamKind::CrashId => {
            if canonical::is_crash_id(rest) {
                Literal::Text(rest.to_string())
            } else {
                return Err(format!("Bad value for parameter(s) '{}'", rest));
            }
        }
        ParamKind::Number => match rest.parse::<f64>() {
            Ok(n) if n.is_finite() => Literal::Number(n),
            _ => return Err(format!("'{}' is not a number.", rest)),
        },
        ParamKind::Date => match sanitize_date(rest) {
            Some(date) => Literal::Date(date),
            None => return Err(format!("'{}' is not a valid date.", rest)),
        },
        ParamKind::Enum(options) => {
            if options.contains(&rest) {
                Literal::Text(rest.to_string())
            } else {
                return Err(format!("Bad value for parameter(s) '{}'", rest));
            }
        }
        // Sentinel-only kinds never reach literal coercion: any literal
        // value already failed the operator table above.
        ParamKind::Boolean | ParamKind::Flag => {
            return Err(format!("Bad value for parameter(s) '{}'", rest));
        }
    };

    Ok(Constraint {
        operator,
        value: Some(literal),
    })
}

fn display_operator(operator: Operator) -> &'static str {
    match operator {
        Operator::Equals => "=",
        other => other.symbol(),
    }
}

/// Dates are `YYYY-MM-DD` or `YYYY-MM-DDTHH:MM:SSZ`, nothing fancier.
fn sanitize_date(raw: &str) -> Option<String> {
    let bytes = raw.as_bytes();
    let digit = |idx: usize| bytes.get(idx).is_some_and(|b| b.is_ascii_digit());
    let lit = |idx: usize, c: u8| bytes.get(idx) == Some(&c);

    let date_part = digit(0)
        && digit(1)
        && digit(2)
        && digit(3)
        && lit(4, b'-')
        && digit(5)
        && digit(6)
        && lit(7, b'-')
        && digit(8)
        && digit(9);

    if !date_part {
        return None;
    }

    match bytes.len() {
        10 => Some(raw.to_string()),
        20 => {
            let time_part = lit(10, b'T')
                && digit(11)
                && digit(12)
                && lit(13, b':')
                && digit(14)
                && digit(15)
                && lit(16, b':')
                && digit(17)
                && digit(18)
                && lit(19, b'Z');
            time_part.then(|| raw.to_string())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(name: &str, value: &str) -> Vec<(String, String)> {
        vec![(name.to_string(), value.to_string())]
    }

    #[test]
    fn missing_required_parameter_is_an_error() {
        let schema = [ParamSpec::text("product").required()];
        let errors = validate(&schema, &[]).unwrap_err();
        assert_eq!(errors["product"], vec![REQUIRED_MESSAGE.to_string()]);
    }

    #[test]
    fn empty_required_list_is_rejected_empty_optional_list_passes() {
        let required = [ParamSpec::text("signatures").required().multiple()];
        let errors = validate(&required, &one("signatures", "")).unwrap_err();
        assert_eq!(errors["signatures"], vec![REQUIRED_MESSAGE.to_string()]);

        let optional = [ParamSpec::text("signatures").multiple()];
        let params = validate(&optional, &one("signatures", "")).unwrap();
        assert!(params.get("signatures").is_none());
    }

    #[test]
    fn null_bytes_are_rejected_never_stripped() {
        let schema = [ParamSpec::text("q")];
        let errors = validate(&schema, &one("q", "Embedded_Null_\x00")).unwrap_err();
        assert_eq!(errors["q"], vec!["Null characters are not allowed.".to_string()]);
    }

    #[test]
    fn comma_joined_and_repeated_keys_both_build_lists() {
        let schema = [ParamSpec::text("product").multiple()];

        let params = validate(&schema, &one("product", "WaterWolf, NightTrain")).unwrap();
        assert_eq!(params.texts("product"), vec!["WaterWolf", "NightTrain"]);

        let repeated = vec![
            ("product".to_string(), "WaterWolf".to_string()),
            ("product".to_string(), "NightTrain".to_string()),
        ];
        let params = validate(&schema, &repeated).unwrap();
        assert_eq!(params.texts("product"), vec!["WaterWolf", "NightTrain"]);
    }

    #[test]
    fn malformed_list_encoding_is_rejected() {
        let schema = [ParamSpec::text("product").multiple()];
        let errors = validate(&schema, &one("product", "a,,b")).unwrap_err();
        assert_eq!(errors["product"], vec!["Malformed list value.".to_string()]);
    }

    #[test]
    fn enum_values_are_checked_against_the_option_set() {
        let schema = [ParamSpec::enumeration("product", &["good"]).required()];

        assert!(validate(&schema, &one("product", "good")).is_ok());

        let errors = validate(&schema, &one("product", "bad")).unwrap_err();
        assert_eq!(
            errors["product"],
            vec!["Bad value for parameter(s) 'bad'".to_string()]
        );
    }

    #[test]
    fn range_operators_parse_on_dates_and_numbers() {
        let schema = [
            ParamSpec::date("date").multiple(),
            ParamSpec::number("build_id"),
        ];
        let raw = vec![
            ("date".to_string(), ">=2022-06-05".to_string()),
            ("date".to_string(), "<2022-06-11T06:08:45Z".to_string()),
            ("build_id".to_string(), ">20120609030536".to_string()),
        ];

        let params = validate(&schema, &raw).unwrap();
        let dates = params.get("date").unwrap().constraints();
        assert_eq!(dates[0].operator, Operator::GreaterOrEqual);
        assert_eq!(dates[0].text(), Some("2022-06-05"));
        assert_eq!(dates[1].operator, Operator::Less);

        let build = params.get("build_id").unwrap().constraints();
        assert_eq!(build[0].operator, Operator::Greater);
        assert_eq!(build[0].number(), Some(20120609030536.0));
    }

    #[test]
    fn bare_date_equality_is_outside_the_operator_table() {
        let schema = [ParamSpec::date("date")];
        let errors = validate(&schema, &one("date", "2022-06-05")).unwrap_err();
        assert!(errors["date"][0].contains("not allowed"));
    }

    #[test]
    fn sentinel_operators_obey_the_per_type_table() {
        let schema = [
            ParamSpec::boolean("is_garbage_collecting"),
            ParamSpec::flag("missing_symbols"),
            ParamSpec::number("uptime"),
        ];

        let params = validate(
            &schema,
            &vec![
                ("is_garbage_collecting".to_string(), "__true__".to_string()),
                ("missing_symbols".to_string(), "__null__".to_string()),
            ],
        )
        .unwrap();
        assert_eq!(
            params.get("is_garbage_collecting").unwrap().constraints()[0].operator,
            Operator::IsTrue
        );
        assert_eq!(
            params.get("missing_symbols").unwrap().constraints()[0].operator,
            Operator::IsNull
        );

        // __null__ on a number is outside the table.
        let errors = validate(&schema, &one("uptime", "__null__")).unwrap_err();
        assert!(errors["uptime"][0].contains("not allowed"));

        // A literal where only a sentinel is allowed fails too.
        let errors = validate(&schema, &one("is_garbage_collecting", "yes")).unwrap_err();
        assert!(!errors["is_garbage_collecting"].is_empty());
    }

    #[test]
    fn crash_ids_are_shape_checked() {
        let schema = [ParamSpec::crash_id("crash_id").required()];

        assert!(validate(&schema, &one("crash_id", "11cb72f5-eb28-41e1-a8e4-849982120611")).is_ok());

        let errors = validate(
            &schema,
            &one("crash_id", "821fcd0c-d925-4900-85b6-687250180607docker/as_me.sh"),
        )
        .unwrap_err();
        assert!(!errors["crash_id"].is_empty());
    }

    #[test]
    fn defaults_fill_absent_parameters() {
        let schema = [ParamSpec::enumeration("format", &["meta", "raw"]).default_value("meta")];
        let params = validate(&schema, &[]).unwrap();
        assert_eq!(params.first_text("format"), Some("meta"));
    }

    #[test]
    fn single_valued_parameters_reject_repeats() {
        let schema = [ParamSpec::text("crash_id")];
        let raw = vec![
            ("crash_id".to_string(), "a".to_string()),
            ("crash_id".to_string(), "b".to_string()),
        ];
        let errors = validate(&schema, &raw).unwrap_err();
        assert_eq!(errors["crash_id"], vec!["Expected a single value.".to_string()]);
    }

    #[test]
    fn constraint_render_round_trips_operator_prefixes() {
        let schema = [
            ParamSpec::date("date").multiple(),
            ParamSpec::text("signature"),
        ];
        let raw = vec![
            ("date".to_string(), ">=2022-06-05".to_string()),
            ("signature".to_string(), "~OOM".to_string()),
        ];
        let params = validate(&schema, &raw).unwrap();
        assert_eq!(
            params.get("date").unwrap().constraints()[0].render(),
            ">=2022-06-05"
        );
        assert_eq!(
            params.get("signature").unwrap().constraints()[0].render(),
            "~OOM"
        );
    }

    #[test]
    fn unknown_parameters_are_ignored() {
        let schema = [ParamSpec::text("product")];
        let params = validate(&schema, &one("nonsense", "x")).unwrap();
        assert!(params.get("nonsense").is_none());
    }
}
