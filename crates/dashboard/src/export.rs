//! Result exports.
//!
//! All exports operate on a copied [`Snapshot`]; nothing here touches the
//! aggregator lock. JSON carries full float precision; CSV columns are
//! fixed to 6 decimals.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::json;

use crate::aggregator::Snapshot;

/// Advisory export file names: `resultados_YYYYMMDD_HHMMSS.csv` and
/// `simulacion_YYYYMMDD_HHMMSS.json`.
pub fn export_file_names(now: DateTime<Utc>) -> (String, String) {
    let stamp = now.format("%Y%m%d_%H%M%S");
    (
        format!("resultados_{stamp}.csv"),
        format!("simulacion_{stamp}.json"),
    )
}

/// Full JSON export: metadata, statistics, normality tests, result rings
/// and convergence history.
pub fn export_json(snapshot: &Snapshot, exported_at: DateTime<Utc>) -> String {
    let value = json!({
        "metadata": {
            "fecha_exportacion": exported_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            "num_resultados": snapshot.results.len(),
            "modelo": snapshot.model_info,
        },
        "estadisticas": snapshot.statistics,
        "tests_normalidad": snapshot.normality,
        "resultados": snapshot.results,
        "resultados_detallados": snapshot.results_raw,
        "convergencia": snapshot.convergence,
    });
    serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string())
}

/// Detailed-result CSV. Statistics ride along as `#` comment lines before
/// the header; `include_metadata` adds the worker and timing columns.
pub fn export_csv(snapshot: &Snapshot, include_metadata: bool) -> String {
    let mut out = String::new();
    push_stats_comments(&mut out, snapshot);

    if include_metadata {
        out.push_str("escenario_id,resultado,consumer_id,tiempo_ejecucion\n");
        for record in &snapshot.results_raw {
            out.push_str(&format!(
                "{},{:.6},{},{:.6}\n",
                record.scenario_id, record.value, record.consumer_id, record.exec_duration_sec
            ));
        }
    } else {
        out.push_str("escenario_id,resultado\n");
        for record in &snapshot.results_raw {
            out.push_str(&format!("{},{:.6}\n", record.scenario_id, record.value));
        }
    }
    out
}

fn push_stats_comments(out: &mut String, snapshot: &Snapshot) {
    out.push_str("# Estadísticas Descriptivas\n");
    match &snapshot.statistics {
        Some(stats) => {
            out.push_str(&format!("# N: {}\n", stats.n));
            out.push_str(&format!("# Media: {:.6}\n", stats.mean));
            out.push_str(&format!("# Mediana: {:.6}\n", stats.median));
            out.push_str(&format!("# Desviación Estándar: {:.6}\n", stats.stddev));
            out.push_str(&format!("# Varianza: {:.6}\n", stats.variance));
            out.push_str(&format!("# Mínimo: {:.6}\n", stats.min));
            out.push_str(&format!("# Máximo: {:.6}\n", stats.max));
        }
        None => out.push_str("# Sin datos disponibles\n"),
    }
}

/// Two-column statistics table.
pub fn export_stats_csv(snapshot: &Snapshot) -> String {
    let mut out = String::from("Estadistica,Valor\n");
    let Some(stats) = &snapshot.statistics else {
        out.push_str("# Sin datos disponibles\n");
        return out;
    };
    out.push_str(&format!("N,{}\n", stats.n));
    out.push_str(&format!("Media,{:.6}\n", stats.mean));
    out.push_str(&format!("Mediana,{:.6}\n", stats.median));
    out.push_str(&format!("Desviacion Estandar,{:.6}\n", stats.stddev));
    out.push_str(&format!("Varianza,{:.6}\n", stats.variance));
    out.push_str(&format!("Minimo,{:.6}\n", stats.min));
    out.push_str(&format!("Maximo,{:.6}\n", stats.max));
    out.push_str(&format!("P25,{:.6}\n", stats.p25));
    out.push_str(&format!("P75,{:.6}\n", stats.p75));
    out.push_str(&format!("P95,{:.6}\n", stats.p95));
    out.push_str(&format!("P99,{:.6}\n", stats.p99));
    out.push_str(&format!("IC 95% Inferior,{:.6}\n", stats.ci95_lower));
    out.push_str(&format!("IC 95% Superior,{:.6}\n", stats.ci95_upper));
    out
}

/// Convergence history as `n,media,varianza,timestamp` rows.
pub fn export_convergence_csv(snapshot: &Snapshot) -> String {
    let mut out = String::from("n,media,varianza,timestamp\n");
    if snapshot.convergence.is_empty() {
        out.push_str("# Sin datos de convergencia disponibles\n");
        return out;
    }
    for point in &snapshot.convergence {
        let at = Utc
            .timestamp_opt(point.at_unix_sec as i64, 0)
            .single()
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default();
        out.push_str(&format!(
            "{},{:.6},{:.6},{}\n",
            point.n, point.mean, point.variance, at
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{Aggregator, AggregatorConfig, ConvergencePoint};
    use azar_model::ResultMessage;

    fn snapshot_with_results(n: u64) -> Snapshot {
        let agg = Aggregator::new(AggregatorConfig {
            convergence_stride: 10,
            ..AggregatorConfig::default()
        });
        for i in 0..n {
            agg.record_result(ResultMessage {
                scenario_id: i,
                consumer_id: format!("C-{}", i % 3),
                value: i as f64,
                exec_duration_sec: 0.01,
            });
        }
        agg.normality(true);
        agg.snapshot()
    }

    #[test]
    fn test_file_names() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 13, 45, 9).unwrap();
        let (csv, json) = export_file_names(now);
        assert_eq!(csv, "resultados_20240501_134509.csv");
        assert_eq!(json, "simulacion_20240501_134509.json");
    }

    #[test]
    fn test_json_structure() {
        let snapshot = snapshot_with_results(100);
        let text = export_json(&snapshot, Utc::now());
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();

        assert!(value["metadata"]["fecha_exportacion"].is_string());
        assert_eq!(value["metadata"]["num_resultados"], 100);
        assert_eq!(value["estadisticas"]["n"], 100);
        assert!(value["tests_normalidad"]["kolmogorov_smirnov"]["pvalue"].is_number());
        assert_eq!(value["resultados"].as_array().unwrap().len(), 100);
        assert_eq!(value["resultados_detallados"].as_array().unwrap().len(), 100);
        assert_eq!(value["convergencia"].as_array().unwrap().len(), 10);
    }

    #[test]
    fn test_json_empty() {
        let snapshot = snapshot_with_results(0);
        let value: serde_json::Value =
            serde_json::from_str(&export_json(&snapshot, Utc::now())).unwrap();
        assert_eq!(value["metadata"]["num_resultados"], 0);
        assert!(value["estadisticas"].is_null());
        assert_eq!(value["resultados"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn test_csv_with_metadata() {
        let snapshot = snapshot_with_results(5);
        let csv = export_csv(&snapshot, true);
        assert!(csv.contains("# Estadísticas Descriptivas"));
        assert!(csv.contains("# Media:"));
        assert!(csv.contains("# Mediana:"));
        assert!(csv.contains("# Desviación Estándar:"));
        assert!(csv.contains("escenario_id,resultado,consumer_id,tiempo_ejecucion"));
        let data_rows: Vec<&str> = csv
            .lines()
            .filter(|l| !l.starts_with('#') && !l.starts_with("escenario_id"))
            .collect();
        assert_eq!(data_rows.len(), 5);
        assert!(data_rows[0].starts_with("0,0.000000,C-0,"));
    }

    #[test]
    fn test_csv_without_metadata() {
        let snapshot = snapshot_with_results(5);
        let csv = export_csv(&snapshot, false);
        assert!(csv.contains("escenario_id,resultado\n"));
        assert!(!csv.contains("consumer_id"));
    }

    #[test]
    fn test_stats_csv() {
        let snapshot = snapshot_with_results(100);
        let csv = export_stats_csv(&snapshot);
        assert!(csv.starts_with("Estadistica,Valor\n"));
        assert!(csv.lines().any(|l| l.starts_with("Media,")));
        let ic_rows = csv.lines().filter(|l| l.starts_with("IC 95%")).count();
        assert_eq!(ic_rows, 2);
    }

    #[test]
    fn test_stats_csv_empty() {
        let snapshot = snapshot_with_results(0);
        let csv = export_stats_csv(&snapshot);
        assert!(csv.contains("Sin datos disponibles"));
    }

    #[test]
    fn test_convergence_csv() {
        let mut snapshot = snapshot_with_results(30);
        snapshot.convergence = vec![ConvergencePoint {
            n: 10,
            mean: 1.0,
            variance: 0.5,
            at_unix_sec: 1_700_000_000.0,
        }];
        let csv = export_convergence_csv(&snapshot);
        assert!(csv.starts_with("n,media,varianza,timestamp\n"));
        assert!(csv.contains("10,1.000000,0.500000,2023-"));
    }

    #[test]
    fn test_convergence_csv_empty() {
        let snapshot = snapshot_with_results(5);
        let csv = export_convergence_csv(&snapshot);
        assert!(csv.contains("Sin datos de convergencia disponibles"));
    }
}
