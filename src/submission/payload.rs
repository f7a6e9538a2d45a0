//! Ticket → external budget-schema transform.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::DEFAULT_CATEGORY_CODE;
use crate::error::{EngineError, Result};
use crate::models::ticket::Ticket;

/// Payload shape the budget-management system accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSubmissionPayload {
    pub ticket_number: String,
    pub submitter_name: String,
    pub submitter_department: String,
    pub category_code: String,
    /// Populated only when the validation fallback substitutes one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fiscal_year_id: Option<String>,
    pub lines: Vec<BudgetLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetLine {
    pub description: String,
    pub amount: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

impl BudgetSubmissionPayload {
    /// Flatten a ticket into the external schema. Amounts arrive as numbers
    /// or as strings that may carry thousands separators; blank line
    /// descriptions get a synthetic one; a blank sub-category falls back to
    /// the default category code.
    pub fn from_ticket(ticket: &Ticket) -> Result<Self> {
        let category_code = match ticket.sub_category.as_deref() {
            Some(sub) if !sub.trim().is_empty() => sub.trim().to_string(),
            _ => DEFAULT_CATEGORY_CODE.to_string(),
        };

        let mut lines = Vec::with_capacity(ticket.line_items.len());
        for (index, item) in ticket.line_items.iter().enumerate() {
            let description = match item.description.as_deref() {
                Some(text) if !text.trim().is_empty() => text.trim().to_string(),
                _ => format!("Line item {} for ticket {}", index + 1, ticket.ticket_number),
            };
            lines.push(BudgetLine {
                description,
                amount: coerce_amount(&item.amount)?,
                account_id: item.account_id.clone(),
            });
        }

        Ok(Self {
            ticket_number: ticket.ticket_number.clone(),
            submitter_name: ticket.employee.name.clone(),
            submitter_department: ticket.employee.department.clone(),
            category_code,
            fiscal_year_id: None,
            lines,
        })
    }
}

/// Parse an amount that may be a JSON number or a string such as
/// `"1,234.56"`.
pub fn coerce_amount(value: &Value) -> Result<f64> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| EngineError::Validation {
            message: format!("line item amount {n} is not representable"),
        }),
        Value::String(s) => {
            let cleaned: String = s.chars().filter(|c| *c != ',').collect();
            cleaned
                .trim()
                .parse::<f64>()
                .map_err(|_| EngineError::Validation {
                    message: format!("line item amount {s:?} is not numeric"),
                })
        }
        other => Err(EngineError::Validation {
            message: format!("line item amount has unsupported type: {other}"),
        }),
    }
}
