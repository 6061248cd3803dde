//! Anomaly detection over aggregated audit counts
//!
//! Thresholds are fixed constants.

use super::models::{Anomaly, AnomalyKind, AuditAggregate, AuditEventType, AuditSeverity};

/// Failure ratio above which a window is anomalous
pub const FAILURE_RATE_THRESHOLD: f64 = 0.3;

/// Fewer events than this never raise a failure-rate anomaly
pub const FAILURE_RATE_MIN_SAMPLE: u64 = 10;

/// Events from one actor in one window
pub const ACTOR_VOLUME_THRESHOLD: u64 = 1000;

/// Events of one security-relevant type in one window
pub const SECURITY_BURST_THRESHOLD: u64 = 50;

/// Failed or errored events over the total
pub fn failure_rate(agg: &AuditAggregate) -> f64 {
    if agg.total == 0 {
        return 0.0;
    }
    let failed = agg.by_outcome.get("failure").copied().unwrap_or(0)
        + agg.by_outcome.get("error").copied().unwrap_or(0);
    failed as f64 / agg.total as f64
}

pub fn detect(agg: &AuditAggregate) -> Vec<Anomaly> {
    let mut anomalies = Vec::new();

    let rate = failure_rate(agg);
    if agg.total >= FAILURE_RATE_MIN_SAMPLE && rate > FAILURE_RATE_THRESHOLD {
        anomalies.push(Anomaly {
            kind: AnomalyKind::HighFailureRate,
            severity: AuditSeverity::Warning,
            description: format!(
                "{:.1}% of {} events failed",
                rate * 100.0,
                agg.total
            ),
            subject: None,
            observed: rate,
            threshold: FAILURE_RATE_THRESHOLD,
        });
    }

    let mut actors: Vec<(&String, &u64)> = agg
        .by_actor
        .iter()
        .filter(|(_, count)| **count > ACTOR_VOLUME_THRESHOLD)
        .collect();
    actors.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
    for (actor_id, count) in actors {
        anomalies.push(Anomaly {
            kind: AnomalyKind::ActorVolume,
            severity: AuditSeverity::Warning,
            description: format!("Actor '{}' produced {} events", actor_id, count),
            subject: Some(actor_id.clone()),
            observed: *count as f64,
            threshold: ACTOR_VOLUME_THRESHOLD as f64,
        });
    }

    for event_type in AuditEventType::ALL
        .into_iter()
        .filter(AuditEventType::is_security_relevant)
    {
        let count = agg.by_type.get(event_type.as_str()).copied().unwrap_or(0);
        if count > SECURITY_BURST_THRESHOLD {
            anomalies.push(Anomaly {
                kind: AnomalyKind::SecurityBurst,
                severity: AuditSeverity::Critical,
                description: format!("{} {} events in window", count, event_type),
                subject: Some(event_type.as_str().to_string()),
                observed: count as f64,
                threshold: SECURITY_BURST_THRESHOLD as f64,
            });
        }
    }

    anomalies
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn aggregate(total: u64, failures: u64) -> AuditAggregate {
        AuditAggregate {
            total,
            by_outcome: HashMap::from([
                ("failure".to_string(), failures),
                ("success".to_string(), total - failures),
            ]),
            ..Default::default()
        }
    }

    #[test]
    fn test_failure_rate_needs_minimum_sample() {
        assert!(detect(&aggregate(9, 9)).is_empty());

        let anomalies = detect(&aggregate(10, 4));
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyKind::HighFailureRate);

        // exactly 30% is not above the threshold
        assert!(detect(&aggregate(10, 3)).is_empty());
    }

    #[test]
    fn test_actor_volume_and_security_burst() {
        let agg = AuditAggregate {
            total: 1200,
            by_actor: HashMap::from([
                ("bot-7".to_string(), 1001),
                ("alice".to_string(), 199),
            ]),
            by_type: HashMap::from([
                ("login_failure".to_string(), 51),
                ("access_denied".to_string(), 50),
                ("data_access".to_string(), 1099),
            ]),
            ..Default::default()
        };

        let anomalies = detect(&agg);
        let kinds: Vec<(AnomalyKind, Option<String>)> = anomalies
            .iter()
            .map(|a| (a.kind, a.subject.clone()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (AnomalyKind::ActorVolume, Some("bot-7".to_string())),
                (AnomalyKind::SecurityBurst, Some("login_failure".to_string())),
            ]
        );
    }
}
