//! Declarative model-file parser.
//!
//! The format is section-labelled plain text:
//!
//! ```text
//! [METADATA]
//! nombre = suma_normal
//! version = 1.0
//!
//! [VARIABLES]
//! x, float, normal, media=0, std=1
//!
//! [FUNCION]
//! tipo = expresion
//! expresion = x + y
//!
//! [SIMULACION]
//! numero_escenarios = 10000
//! semilla_aleatoria = 42
//! ```
//!
//! Lines beginning with `#` or `;` are ignored. A `codigo =` marker starts a
//! multi-line block that runs to the end of the section; common indentation
//! is stripped, relative indentation preserved. The function is statically
//! validated here (and never evaluated): the producer refuses a bad model
//! before anything is published.

use std::path::Path;

use crate::error::{ParseError, Section};
use crate::types::{
    DistributionKind, FunctionSpec, Model, SimulationSpec, VariableKind, VariableSpec,
};

/// Parse and validate a model file.
pub fn parse_model_file(path: impl AsRef<Path>) -> Result<Model, ParseError> {
    let path = path.as_ref();
    let source = std::fs::read_to_string(path).map_err(|e| {
        ParseError::new(
            Section::Metadata,
            0,
            format!("cannot read '{}': {e}", path.display()),
        )
    })?;
    parse_model_str(&source)
}

/// Parse and validate model source text.
pub fn parse_model_str(source: &str) -> Result<Model, ParseError> {
    let sections = split_sections(source)?;

    let metadata = section(&sections, Section::Metadata)?;
    let variables = section(&sections, Section::Variables)?;
    let function = section(&sections, Section::Function)?;
    let simulation = section(&sections, Section::Simulation)?;

    let (name, version, description, author, creation_date) = parse_metadata(metadata)?;
    let variables = parse_variables(variables)?;
    let function = parse_function(function)?;
    let simulation = parse_simulation(simulation)?;

    validate_function(&function)?;

    Ok(Model {
        name,
        version,
        description,
        author,
        creation_date,
        variables,
        function,
        simulation,
    })
}

/// A section's raw lines with their 1-based file line numbers.
type SectionLines<'a> = Vec<(usize, &'a str)>;

fn split_sections(source: &str) -> Result<Vec<(Section, SectionLines<'_>)>, ParseError> {
    let mut sections: Vec<(Section, SectionLines)> = Vec::new();
    let mut current: Option<usize> = None;

    for (idx, raw) in source.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = raw.trim();

        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            let label = &trimmed[1..trimmed.len() - 1];
            let section = match label {
                "METADATA" => Section::Metadata,
                "VARIABLES" => Section::Variables,
                "FUNCION" => Section::Function,
                "SIMULACION" => Section::Simulation,
                other => {
                    return Err(ParseError::new(
                        Section::Metadata,
                        line_no,
                        format!("unknown section '[{other}]'"),
                    ))
                }
            };
            if sections.iter().any(|(s, _)| *s == section) {
                return Err(ParseError::new(
                    section,
                    line_no,
                    format!("duplicate section {section}"),
                ));
            }
            sections.push((section, Vec::new()));
            current = Some(sections.len() - 1);
            continue;
        }

        if let Some(i) = current {
            sections[i].1.push((line_no, raw));
        } else if !trimmed.is_empty() && !is_comment(trimmed) {
            return Err(ParseError::new(
                Section::Metadata,
                line_no,
                "content before the first section header",
            ));
        }
    }

    Ok(sections)
}

fn section<'a>(
    sections: &'a [(Section, SectionLines<'a>)],
    wanted: Section,
) -> Result<&'a SectionLines<'a>, ParseError> {
    sections
        .iter()
        .find(|(s, _)| *s == wanted)
        .map(|(_, lines)| lines)
        .ok_or_else(|| ParseError::new(wanted, 0, format!("missing section {wanted}")))
}

fn is_comment(trimmed: &str) -> bool {
    trimmed.starts_with('#') || trimmed.starts_with(';')
}

/// `key = value` pairs of a section, skipping blanks and comments.
fn key_values<'a>(lines: &SectionLines<'a>, sec: Section) -> Result<Vec<(usize, &'a str, &'a str)>, ParseError> {
    let mut out = Vec::new();
    for (line_no, raw) in lines {
        let trimmed = raw.trim();
        if trimmed.is_empty() || is_comment(trimmed) {
            continue;
        }
        match trimmed.split_once('=') {
            Some((key, value)) => out.push((*line_no, key.trim(), value.trim())),
            None => {
                return Err(ParseError::new(
                    sec,
                    *line_no,
                    format!("expected 'key = value', found '{trimmed}'"),
                ))
            }
        }
    }
    Ok(out)
}

fn parse_metadata(
    lines: &SectionLines<'_>,
) -> Result<(String, String, String, String, String), ParseError> {
    let mut name = None;
    let mut version = None;
    let mut description = String::new();
    let mut author = String::new();
    let mut creation_date = String::new();

    for (line_no, key, value) in key_values(lines, Section::Metadata)? {
        match key {
            "nombre" => name = Some(value.to_string()),
            "version" => version = Some(value.to_string()),
            "descripcion" => description = value.to_string(),
            "autor" => author = value.to_string(),
            "fecha_creacion" => creation_date = value.to_string(),
            other => {
                return Err(ParseError::new(
                    Section::Metadata,
                    line_no,
                    format!("unknown metadata field '{other}'"),
                ))
            }
        }
    }

    let name = name.ok_or_else(|| {
        ParseError::new(Section::Metadata, 0, "required field 'nombre' is missing")
    })?;
    if name.is_empty() {
        return Err(ParseError::new(Section::Metadata, 0, "'nombre' is empty"));
    }
    let version = version.ok_or_else(|| {
        ParseError::new(Section::Metadata, 0, "required field 'version' is missing")
    })?;

    Ok((name, version, description, author, creation_date))
}

fn parse_variables(lines: &SectionLines<'_>) -> Result<Vec<VariableSpec>, ParseError> {
    let mut variables: Vec<VariableSpec> = Vec::new();

    for (line_no, raw) in lines {
        let trimmed = raw.trim();
        if trimmed.is_empty() || is_comment(trimmed) {
            continue;
        }
        let var = parse_variable_line(trimmed, *line_no)?;
        if variables.iter().any(|v| v.name == var.name) {
            return Err(ParseError::new(
                Section::Variables,
                *line_no,
                format!("duplicate variable '{}'", var.name),
            ));
        }
        variables.push(var);
    }

    if variables.is_empty() {
        return Err(ParseError::new(
            Section::Variables,
            0,
            "no variables defined",
        ));
    }
    Ok(variables)
}

/// `name, kind, distribution, k1=v1, k2=v2, ...`
fn parse_variable_line(line: &str, line_no: usize) -> Result<VariableSpec, ParseError> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() < 3 {
        return Err(ParseError::new(
            Section::Variables,
            line_no,
            "expected 'name, kind, distribution, param=value, ...'",
        ));
    }

    let name = parts[0];
    if name.is_empty() || !is_identifier(name) {
        return Err(ParseError::new(
            Section::Variables,
            line_no,
            format!("'{name}' is not a valid variable name"),
        ));
    }

    let kind = VariableKind::parse(&parts[1].to_lowercase()).ok_or_else(|| {
        ParseError::new(
            Section::Variables,
            line_no,
            format!("kind '{}' is not one of: int, float", parts[1]),
        )
    })?;

    let distribution =
        DistributionKind::parse(&parts[2].to_lowercase()).ok_or_else(|| {
            ParseError::new(
                Section::Variables,
                line_no,
                format!(
                    "distribution '{}' is not supported (supported: {})",
                    parts[2],
                    DistributionKind::ALL.map(|d| d.name()).join(", ")
                ),
            )
        })?;

    let mut params = indexmap::IndexMap::new();
    for part in &parts[3..] {
        let (key, value) = part.split_once('=').ok_or_else(|| {
            ParseError::new(
                Section::Variables,
                line_no,
                format!("parameter '{part}' is not of the form 'name=value'"),
            )
        })?;
        let value: f64 = value.trim().parse().map_err(|_| {
            ParseError::new(
                Section::Variables,
                line_no,
                format!("parameter '{}' has a non-numeric value '{}'", key.trim(), value.trim()),
            )
        })?;
        params.insert(key.trim().to_string(), value);
    }

    Ok(VariableSpec {
        name: name.to_string(),
        kind,
        distribution,
        params,
    })
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_function(lines: &SectionLines<'_>) -> Result<FunctionSpec, ParseError> {
    // Only non-indented lines carry section parameters; indented lines can
    // only belong to a `codigo` block.
    let top_level = |raw: &str| !raw.starts_with([' ', '\t']);

    let mut kind: Option<(usize, String)> = None;
    for (line_no, raw) in lines {
        let trimmed = raw.trim();
        if trimmed.is_empty() || is_comment(trimmed) || !top_level(raw) {
            continue;
        }
        if let Some((key, value)) = trimmed.split_once('=') {
            if key.trim() == "tipo" {
                kind = Some((*line_no, value.trim().to_lowercase()));
                break;
            }
        }
    }

    let (kind_line, kind) = kind.ok_or_else(|| {
        ParseError::new(Section::Function, 0, "required field 'tipo' is missing")
    })?;

    match kind.as_str() {
        "expresion" => {
            for (line_no, raw) in lines {
                let trimmed = raw.trim();
                if !top_level(raw) || is_comment(trimmed) {
                    continue;
                }
                if let Some((key, value)) = trimmed.split_once('=') {
                    if key.trim() == "expresion" {
                        let expression = value.trim();
                        if expression.is_empty() {
                            return Err(ParseError::new(
                                Section::Function,
                                *line_no,
                                "'expresion' is empty",
                            ));
                        }
                        return Ok(FunctionSpec::Expression(expression.to_string()));
                    }
                }
            }
            Err(ParseError::new(
                Section::Function,
                kind_line,
                "field 'expresion' is required when tipo = expresion",
            ))
        }
        "codigo" => {
            for (line_no, raw) in lines {
                let trimmed = raw.trim();
                if !top_level(raw) || is_comment(trimmed) {
                    continue;
                }
                if let Some((key, value)) = trimmed.split_once('=') {
                    if key.trim() == "codigo" {
                        return parse_code_block(lines, *line_no, value);
                    }
                }
            }
            Err(ParseError::new(
                Section::Function,
                kind_line,
                "field 'codigo' is required when tipo = codigo",
            ))
        }
        other => Err(ParseError::new(
            Section::Function,
            kind_line,
            format!("function type '{other}' is not one of: expresion, codigo"),
        )),
    }
}

/// Collect the `codigo` block: inline content on the marker line, then every
/// subsequent line of the section that is not a top-level `key = value` pair
/// or comment. Common indentation is stripped at the end.
fn parse_code_block(
    lines: &SectionLines<'_>,
    marker_line: usize,
    inline: &str,
) -> Result<FunctionSpec, ParseError> {
    let mut code_lines: Vec<String> = Vec::new();
    if !inline.trim().is_empty() {
        code_lines.push(inline.trim().to_string());
    }

    for (line_no, raw) in lines {
        if *line_no <= marker_line {
            continue;
        }
        let trimmed = raw.trim();
        if is_comment(trimmed) {
            continue;
        }
        // A non-indented `key = value` line is another section parameter,
        // not code.
        if !raw.starts_with([' ', '\t']) && trimmed.contains('=') && !trimmed.contains("==") {
            continue;
        }
        code_lines.push(raw.trim_end().to_string());
    }

    let code = dedent(&code_lines.join("\n"));
    let code = code.trim().to_string();
    if code.is_empty() {
        return Err(ParseError::new(
            Section::Function,
            marker_line,
            "'codigo' block is empty",
        ));
    }
    Ok(FunctionSpec::Code(code))
}

/// Strip the common leading indentation, preserving relative indentation.
fn dedent(code: &str) -> String {
    let min_indent = code
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);
    code.lines()
        .map(|line| {
            if line.trim().is_empty() {
                ""
            } else {
                &line[min_indent..]
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn parse_simulation(lines: &SectionLines<'_>) -> Result<SimulationSpec, ParseError> {
    let mut num_scenarios: Option<u64> = None;
    let mut seed: Option<u64> = None;

    for (line_no, key, value) in key_values(lines, Section::Simulation)? {
        match key {
            "numero_escenarios" => {
                let parsed: i64 = value.parse().map_err(|_| {
                    ParseError::new(
                        Section::Simulation,
                        line_no,
                        format!("'numero_escenarios' must be an integer, found '{value}'"),
                    )
                })?;
                if parsed <= 0 {
                    return Err(ParseError::new(
                        Section::Simulation,
                        line_no,
                        format!("'numero_escenarios' must be > 0, found {parsed}"),
                    ));
                }
                num_scenarios = Some(parsed as u64);
            }
            "semilla_aleatoria" => {
                seed = Some(value.parse().map_err(|_| {
                    ParseError::new(
                        Section::Simulation,
                        line_no,
                        format!("'semilla_aleatoria' must be an integer, found '{value}'"),
                    )
                })?);
            }
            other => {
                return Err(ParseError::new(
                    Section::Simulation,
                    line_no,
                    format!("unknown simulation field '{other}'"),
                ))
            }
        }
    }

    let num_scenarios = num_scenarios.ok_or_else(|| {
        ParseError::new(
            Section::Simulation,
            0,
            "required field 'numero_escenarios' is missing",
        )
    })?;

    Ok(SimulationSpec {
        num_scenarios,
        seed,
    })
}

/// Static function validation. Compiles (parses + security-validates) the
/// function without evaluating it.
fn validate_function(function: &FunctionSpec) -> Result<(), ParseError> {
    let result = match function {
        FunctionSpec::Expression(src) => azar_lang::compile_expression(src).map(|_| ()),
        FunctionSpec::Code(src) => azar_lang::compile_code(src).map(|_| ()),
    };
    result.map_err(|e| ParseError::new(Section::Function, 0, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = "\
[METADATA]
nombre = suma_normal
version = 1.0
descripcion = suma de dos variables normales
autor = equipo
fecha_creacion = 2024-05-01

[VARIABLES]
# dos normales estandar
x, float, normal, media=0, std=1
y, float, normal, media=0, std=1

[FUNCION]
tipo = expresion
expresion = x + y

[SIMULACION]
numero_escenarios = 10000
semilla_aleatoria = 42
";

    const WITH_CODE: &str = "\
[METADATA]
nombre = distancia
version = 2.0

[VARIABLES]
x, float, normal, media=0, std=1
y, float, normal, media=0, std=1

[FUNCION]
tipo = codigo
codigo =
    import math
    d = math.sqrt(x**2 + y**2)
    resultado = d

[SIMULACION]
numero_escenarios = 1000
semilla_aleatoria = 7
";

    #[test]
    fn test_parse_simple_model() {
        let model = parse_model_str(SIMPLE).unwrap();
        assert_eq!(model.name, "suma_normal");
        assert_eq!(model.version, "1.0");
        assert_eq!(model.variables.len(), 2);
        assert_eq!(model.variables[0].name, "x");
        assert_eq!(model.variables[0].distribution, DistributionKind::Normal);
        assert_eq!(model.variables[0].params["media"], 0.0);
        assert_eq!(model.function, FunctionSpec::Expression("x + y".into()));
        assert_eq!(model.simulation.num_scenarios, 10_000);
        assert_eq!(model.simulation.seed, Some(42));
    }

    #[test]
    fn test_parse_code_model_dedents() {
        let model = parse_model_str(WITH_CODE).unwrap();
        match &model.function {
            FunctionSpec::Code(code) => {
                assert!(code.starts_with("import math"));
                assert!(code.contains("\nd = math.sqrt"));
                assert!(code.ends_with("resultado = d"));
            }
            other => panic!("unexpected function: {other:?}"),
        }
    }

    #[test]
    fn test_relative_indentation_preserved() {
        let source = "\
[METADATA]
nombre = m
version = 1

[VARIABLES]
x, float, uniform, min=0, max=1

[FUNCION]
tipo = codigo
codigo =
    total = 0
    for i in range(3):
        total += x
    resultado = total

[SIMULACION]
numero_escenarios = 10
";
        let model = parse_model_str(source).unwrap();
        match &model.function {
            FunctionSpec::Code(code) => {
                assert!(code.contains("for i in range(3):\n    total += x"));
            }
            other => panic!("unexpected function: {other:?}"),
        }
    }

    #[test]
    fn test_missing_section() {
        let source = "[METADATA]\nnombre = m\nversion = 1\n";
        let err = parse_model_str(source).unwrap_err();
        assert_eq!(err.section, Section::Variables);
    }

    #[test]
    fn test_unknown_distribution() {
        let source = SIMPLE.replace("normal, media=0, std=1", "gamma, k=1, theta=2");
        let err = parse_model_str(&source).unwrap_err();
        assert_eq!(err.section, Section::Variables);
        assert!(err.message.contains("gamma"));
    }

    #[test]
    fn test_duplicate_variable() {
        let source = SIMPLE.replace("y, float", "x, float");
        let err = parse_model_str(&source).unwrap_err();
        assert!(err.message.contains("duplicate"));
    }

    #[test]
    fn test_non_numeric_parameter() {
        let source = SIMPLE.replace("std=1", "std=uno");
        let err = parse_model_str(&source).unwrap_err();
        assert_eq!(err.section, Section::Variables);
    }

    #[test]
    fn test_zero_scenarios_rejected() {
        let source = SIMPLE.replace("numero_escenarios = 10000", "numero_escenarios = 0");
        let err = parse_model_str(&source).unwrap_err();
        assert_eq!(err.section, Section::Simulation);
    }

    #[test]
    fn test_expression_security_rejected_at_parse() {
        let source = SIMPLE.replace("expresion = x + y", "expresion = __import__(\"os\")");
        let err = parse_model_str(&source).unwrap_err();
        assert_eq!(err.section, Section::Function);
    }

    #[test]
    fn test_code_without_resultado_rejected() {
        let source = WITH_CODE.replace("resultado = d", "salida = d");
        let err = parse_model_str(&source).unwrap_err();
        assert_eq!(err.section, Section::Function);
        assert!(err.message.contains("resultado"));
    }

    #[test]
    fn test_code_with_forbidden_import_rejected() {
        let source = WITH_CODE.replace("import math", "import os");
        let err = parse_model_str(&source).unwrap_err();
        assert_eq!(err.section, Section::Function);
    }

    #[test]
    fn test_round_trip_through_wire() {
        let model = parse_model_str(WITH_CODE).unwrap();
        let msg = crate::ModelMessage::from_model(&model, 1_700_000_000.0);
        let bytes = serde_json::to_vec(&msg).unwrap();
        let back: crate::ModelMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.variables, model.variables);
        assert_eq!(back.function().unwrap(), model.function);
        assert_eq!(back.simulacion, model.simulation);
    }
}
