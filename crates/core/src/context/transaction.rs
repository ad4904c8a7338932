//! `transaction` context handler
//!
//! Parses financial-transaction items: tag values become typed fields
//! (dates, currency amounts, item refs), with cross-field invariants checked
//! once the whole manifest is known.

use super::ContextHandler;
use crate::errors::{LimarError, Result};
use crate::manifest::item::{Item, ItemSet, SharedItem};
use crate::manifest::walker::ContextFrame;
use chrono::NaiveDate;
use indexmap::IndexMap;
use serde::Serialize;

const DEFAULT_CURRENCY: &str = "£";

/// An amount of money in the lowest unit of its currency
///
/// Stored in minor units to avoid floating point errors; the scale records
/// how many fractional digits were given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurrencyAmount {
    pub currency: String,
    pub minor_units: i64,
    pub scale: u32,
}

impl std::fmt::Display for CurrencyAmount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let divisor = 10_i64.pow(self.scale);
        write!(
            f,
            "{}{}.{:0width$}",
            self.currency,
            self.minor_units / divisor,
            self.minor_units % divisor,
            width = self.scale as usize
        )
    }
}

/// The typed fields of a transaction item
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transaction {
    pub from: String,
    pub to: String,
    pub paid: Option<NaiveDate>,
    pub cleared: Option<NaiveDate>,
    pub cover_start: Option<NaiveDate>,
    pub cover_end: Option<NaiveDate>,
    pub amount: CurrencyAmount,
    pub purpose: Option<String>,
}

#[derive(Default)]
pub struct FinancialTransaction;

impl ContextHandler for FinancialTransaction {
    fn context_type(&self) -> &'static str {
        "transaction"
    }

    fn on_declare_item(&mut self, contexts: &[ContextFrame], item: &SharedItem) -> Result<()> {
        let mut item = item.borrow_mut();
        item.tags.add("transaction", None);

        // Fall back to the nearest declared default account
        for side in ["from", "to"] {
            if !item.tags.has(side) {
                let default_account = contexts
                    .iter()
                    .rev()
                    .find_map(|frame| frame.opt("default-account"))
                    .ok_or_else(|| {
                        LimarError::manifest(format!(
                            "Transaction '{}' missing '{side}' tag and no default-account is in scope",
                            item.item_ref
                        ))
                    })?
                    .to_string();
                item.tags.add(side, Some(default_account));
            }
        }

        if contexts.iter().any(|frame| frame.has_opt("unverified")) {
            item.tags.add("unverified", None);
        }
        Ok(())
    }

    fn on_exit_manifest(
        &mut self,
        items: &ItemSet,
        _item_sets: &IndexMap<String, ItemSet>,
    ) -> Result<()> {
        for shared in items.values() {
            let is_transaction = shared.borrow().tags.has("transaction");
            if is_transaction {
                let transaction = parse_transaction(&shared.borrow(), items)?;
                shared.borrow_mut().transaction = Some(transaction);
            }
        }
        Ok(())
    }
}

fn parse_transaction(item: &Item, items: &ItemSet) -> Result<Transaction> {
    let from = parse_ref_tag(item, "from", items)?;
    let to = parse_ref_tag(item, "to", items)?;
    if from == to {
        return Err(LimarError::manifest(format!(
            "Cannot create transaction '{}' from and to the same account",
            item.item_ref
        )));
    }

    let paid = parse_date_tag(item, "paid")?;
    let cleared = parse_date_tag(item, "cleared")?;
    if paid.is_none() && cleared.is_none() {
        return Err(LimarError::manifest(format!(
            "Transaction '{}' missing both a paid and cleared date (at least one is required)",
            item.item_ref
        )));
    }

    Ok(Transaction {
        from,
        to,
        paid,
        cleared,
        cover_start: parse_date_tag(item, "coverStart")?,
        cover_end: parse_date_tag(item, "coverEnd")?,
        amount: parse_amount_tag(item, "amount")?,
        purpose: item.tags.value_of("for").map(str::to_string),
    })
}

fn required_value<'a>(item: &'a Item, name: &str) -> Result<&'a str> {
    item.tags.value_of(name).ok_or_else(|| {
        LimarError::manifest(format!(
            "Missing required tag '{name}' in item '{}'",
            item.item_ref
        ))
    })
}

fn parse_ref_tag(item: &Item, name: &str, items: &ItemSet) -> Result<String> {
    let target = required_value(item, name)?;
    if !items.contains_key(target) {
        return Err(LimarError::manifest(format!(
            "Tag '{name}' of item '{}' references unknown item '{target}'",
            item.item_ref
        )));
    }
    Ok(target.to_string())
}

fn parse_date_tag(item: &Item, name: &str) -> Result<Option<NaiveDate>> {
    let Some(value) = item.tags.value_of(name) else {
        return Ok(None);
    };

    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| {
        LimarError::manifest(format!(
            "Value of tag '{name}' in transaction '{}' is not an ISO-8601 date (ie. 'YYYY-MM-DD')",
            item.item_ref
        ))
    })?;
    Ok(Some(date))
}

fn parse_amount_tag(item: &Item, name: &str) -> Result<CurrencyAmount> {
    let value = required_value(item, name)?;
    parse_amount(value).map_err(|message| {
        LimarError::manifest(format!(
            "Could not parse value '{value}' of tag '{name}' in item '{}': {message}",
            item.item_ref
        ))
    })
}

/// Parse `[currency]whole.fraction`, e.g. `£12.99` or `4.50`
fn parse_amount(value: &str) -> std::result::Result<CurrencyAmount, String> {
    let mut rest = value;
    let mut currency = DEFAULT_CURRENCY.to_string();
    if let Some(first) = rest.chars().next() {
        if !first.is_ascii_digit() {
            currency = first.to_string();
            rest = &rest[first.len_utf8()..];
        }
    }

    let (whole, fraction) = rest
        .split_once('.')
        .ok_or_else(|| "a fractional part is required".to_string())?;

    let whole: i64 = whole
        .replace(',', "")
        .parse()
        .map_err(|_| format!("invalid whole part '{whole}'"))?;
    let fraction_value: i64 = fraction
        .parse()
        .map_err(|_| format!("invalid fractional part '{fraction}'"))?;

    let scale = fraction.len() as u32;
    Ok(CurrencyAmount {
        currency,
        minor_units: whole * 10_i64.pow(scale) + fraction_value,
        scale,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::parser::parse;
    use crate::manifest::Walker;

    fn handlers() -> Vec<Box<dyn ContextHandler>> {
        vec![Box::new(FinancialTransaction)]
    }

    #[test]
    fn test_transaction_parsed() -> anyhow::Result<()> {
        let manifest = "\
current-account
grocer
@transaction (default-account: current-account) {
  shop-1 (to: grocer, paid: 2024-03-02, amount: £12.99, for: groceries)
}
";
        let output = Walker::new(handlers()).walk(&parse(manifest)?)?;

        let item = output.items["shop-1"].borrow();
        let transaction = item.transaction.as_ref().unwrap();
        assert_eq!(transaction.from, "current-account");
        assert_eq!(transaction.to, "grocer");
        assert_eq!(
            transaction.paid,
            Some(NaiveDate::from_ymd_opt(2024, 3, 2).unwrap())
        );
        assert_eq!(transaction.cleared, None);
        assert_eq!(
            transaction.amount,
            CurrencyAmount {
                currency: "£".to_string(),
                minor_units: 1299,
                scale: 2,
            }
        );
        assert_eq!(transaction.purpose.as_deref(), Some("groceries"));
        Ok(())
    }

    #[test]
    fn test_same_account_fails() -> anyhow::Result<()> {
        let manifest = "\
acct
@transaction {
  t (from: acct, to: acct, paid: 2024-01-01, amount: 1.00)
}
";
        let err = Walker::new(handlers())
            .walk(&parse(manifest)?)
            .unwrap_err();
        assert!(err.to_string().contains("same account"));
        Ok(())
    }

    #[test]
    fn test_paid_or_cleared_required() -> anyhow::Result<()> {
        let manifest = "\
a
b
@transaction {
  t (from: a, to: b, amount: 1.00)
}
";
        let err = Walker::new(handlers())
            .walk(&parse(manifest)?)
            .unwrap_err();
        assert!(err.to_string().contains("paid and cleared"));
        Ok(())
    }

    #[test]
    fn test_bad_date_fails() -> anyhow::Result<()> {
        let manifest = "\
a
b
@transaction {
  t (from: a, to: b, paid: 2024-13-40, amount: 1.00)
}
";
        assert!(Walker::new(handlers()).walk(&parse(manifest)?).is_err());
        Ok(())
    }

    #[test]
    fn test_amount_parsing() {
        let amount = parse_amount("£1,234.56").unwrap();
        assert_eq!(amount.minor_units, 123456);
        assert_eq!(amount.to_string(), "£1234.56");

        let amount = parse_amount("4.5").unwrap();
        assert_eq!(amount.currency, "£");
        assert_eq!(amount.minor_units, 45);
        assert_eq!(amount.scale, 1);

        assert!(parse_amount("12").is_err());
    }

    #[test]
    fn test_unverified_propagates() -> anyhow::Result<()> {
        let manifest = "\
a
b
@transaction (unverified) {
  t (from: a, to: b, cleared: 2024-02-01, amount: $3.00)
}
";
        let output = Walker::new(handlers()).walk(&parse(manifest)?)?;
        let item = output.items["t"].borrow();
        assert!(item.tags.has("unverified"));
        assert_eq!(item.transaction.as_ref().unwrap().amount.currency, "$");
        Ok(())
    }
}
