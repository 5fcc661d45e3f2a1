//! Alert email templates. Each renders a subject and both MIME parts.

use crate::evaluator::TriggerData;
use pulse_core::RiskLevel;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
    pub text: String,
}

pub fn render(rule_name: &str, data: &TriggerData) -> RenderedEmail {
    let name = data.customer_name();
    let (subject, lines) = match data {
        TriggerData::ScoreBelow {
            score, threshold, risk_level, ..
        } => (
            format!("{} health score is {}", name, score),
            vec![
                format!("{}'s health score is {}, below your threshold of {}.", name, score, threshold),
                format!("Current risk level: {}.", risk_label(*risk_level)),
            ],
        ),
        TriggerData::ScoreDrop {
            previous_score,
            current_score,
            drop,
            days,
            weakest_factor,
            ..
        } => {
            let mut lines = vec![format!(
                "{}'s health score fell {} points in {} days, from {} to {}.",
                name, drop, days, previous_score, current_score
            )];
            if let Some((factor, value)) = weakest_factor {
                lines.push(format!(
                    "Biggest contributor: {} ({:.0}/100).",
                    factor_label(factor),
                    value * 100.0
                ));
            }
            (format!("{} health score dropped {} points", name, drop), lines)
        }
        TriggerData::RiskChange {
            previous, new, score, ..
        } => (
            format!("{} moved to {} risk", name, risk_label(*new)),
            vec![format!(
                "{} moved from {} to {} risk with a health score of {}.",
                name,
                risk_label(*previous),
                risk_label(*new),
                score
            )],
        ),
        TriggerData::PaymentFailed {
            amount_cents,
            currency,
            failure_reason,
            ..
        } => {
            let amount = format_amount(*amount_cents, currency.as_deref());
            let mut lines = vec![format!("A payment of {} from {} failed.", amount, name)];
            if let Some(reason) = failure_reason {
                lines.push(format!("Reason: {}.", reason));
            }
            (format!("Payment failed for {}", name), lines)
        }
    };

    let footer = format!("Sent by the \"{}\" alert rule.", rule_name);
    let text = lines
        .iter()
        .chain(std::iter::once(&footer))
        .cloned()
        .collect::<Vec<_>>()
        .join("\n\n");
    let body: String = lines
        .iter()
        .map(|line| format!("<p>{}</p>", escape_html(line)))
        .collect();
    let html = format!(
        "<!DOCTYPE html><html><body><h2>{}</h2>{}<p style=\"color:#888;font-size:12px\">{}</p></body></html>",
        escape_html(&subject),
        body,
        escape_html(&footer)
    );

    RenderedEmail { subject, html, text }
}

fn risk_label(level: RiskLevel) -> &'static str {
    match level {
        RiskLevel::Green => "low",
        RiskLevel::Yellow => "medium",
        RiskLevel::Red => "high",
    }
}

fn factor_label(factor: &str) -> String {
    factor.replace('_', " ")
}

/// `1234, Some("usd")` → `12.34 USD`.
fn format_amount(cents: i64, currency: Option<&str>) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    let amount = format!("{}{}.{:02}", sign, abs / 100, abs % 100);
    match currency {
        Some(code) => format!("{} {}", amount, code.to_uppercase()),
        None => amount,
    }
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_drop_names_weakest_factor() {
        let email = render(
            "Drops",
            &TriggerData::ScoreDrop {
                customer_name: "Acme".into(),
                previous_score: 85,
                current_score: 70,
                drop: 15,
                days: 7,
                weakest_factor: Some(("failed_payments".into(), 0.25)),
            },
        );
        assert_eq!(email.subject, "Acme health score dropped 15 points");
        assert!(email.text.contains("from 85 to 70"));
        assert!(email.text.contains("failed payments (25/100)"));
        assert!(email.html.contains("<h2>Acme health score dropped 15 points</h2>"));
    }

    #[test]
    fn test_payment_failed_formats_amount() {
        let email = render(
            "Billing",
            &TriggerData::PaymentFailed {
                customer_name: "Acme".into(),
                payment_id: "ch_1".into(),
                amount_cents: 5_005,
                currency: Some("usd".into()),
                failure_reason: Some("card_declined".into()),
            },
        );
        assert!(email.text.contains("50.05 USD"));
        assert!(email.text.contains("card_declined"));
        assert!(email.text.ends_with("Sent by the \"Billing\" alert rule."));
    }

    #[test]
    fn test_html_is_escaped() {
        let email = render(
            "r",
            &TriggerData::RiskChange {
                customer_name: "<script>".into(),
                previous: RiskLevel::Green,
                new: RiskLevel::Red,
                score: 20,
            },
        );
        assert!(!email.html.contains("<script>"));
        assert!(email.html.contains("&lt;script&gt;"));
        assert_eq!(email.subject, "<script> moved to high risk");
    }

    #[test]
    fn test_negative_amount() {
        assert_eq!(format_amount(-150, None), "-1.50");
    }
}
