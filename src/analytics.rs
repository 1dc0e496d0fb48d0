//! Terminal and JSON rendering of run results.

use crate::cache::CachedField;
use crate::engine::PortfolioReport;
use crate::optimizer::{FrontierPoint, OptimizationResult, Suggestion};
use crate::rebalance::{TradeAction, TradeInstruction};
use crate::scenario::{FxStressResult, ScenarioResult};
use crate::types::{Allocation, Currency};
use crate::valuation::Valuation;
use chrono::Utc;
use colored::Colorize;
use tabled::{builder::Builder, settings::Style};

/// Format reports for terminal display.
pub struct ReportFormatter;

impl ReportFormatter {
    /// Print a full run report to stdout.
    pub fn print_report(report: &PortfolioReport) {
        println!();
        println!("{}", "═".repeat(60).blue());
        println!("{}", format!(" PORTFOLIO: {} ", report.portfolio).bold().blue());
        println!("{}", "═".repeat(60).blue());
        println!();

        println!("{}", "Market Inputs".bold().underline());
        println!("  Run:             {}", report.run_id);
        println!(
            "  Risk-free rate:  {:>11.2}%{}",
            report.risk_free_rate.value * 100.0,
            Self::quote_flag(report.risk_free_rate.stale, report.risk_free_rate.assumed)
        );
        println!(
            "  USD/JPY:         {:>12.2}{}",
            report.usd_jpy.value,
            Self::quote_flag(report.usd_jpy.stale, report.usd_jpy.assumed)
        );
        if !report.stale_fields.is_empty() {
            println!(
                "  {} {}",
                "Stale:".yellow(),
                report.stale_fields.join(", ")
            );
        }
        for (symbol, reason) in &report.excluded {
            println!("  {} {} ({})", "Excluded:".yellow(), symbol, reason);
        }
        println!();

        if let Some(valuation) = &report.valuation {
            println!("{}", "Valuation".bold().underline());
            println!("{}", Self::valuation_table(valuation));
            println!(
                "  Total: ${:.2}  /  ¥{:.0}",
                valuation.total_usd, valuation.total_jpy
            );
            println!();
        }

        if let Some(optimization) = &report.optimization {
            println!("{}", "Optimization".bold().underline());
            println!("{}", Self::suggestions_table(&report.suggestions));
            Self::print_diagnostics(optimization);
            println!();
        }

        if let Some(target) = &report.target {
            println!(
                "{}",
                format!(
                    "Rebalancing ({:?}, amounts in {})",
                    report.target_strategy,
                    report.base_currency.code()
                )
                .bold()
                .underline()
            );
            println!("{}", Self::weights_table(report.current.as_ref(), target));
            println!("{}", Self::trades_table(&report.trades));
            println!();
        }

        if !report.scenarios.is_empty() {
            println!("{}", "Crash Scenarios".bold().underline());
            println!("{}", Self::scenarios_table(&report.scenarios));
            if let Some(worst) = report.scenarios.last() {
                for mitigation in &worst.mitigations {
                    println!("  - {}", mitigation);
                }
            }
            println!();
        }

        if let Some(stress) = &report.fx_stress {
            Self::print_fx_stress(stress);
        }

        for failure in &report.failures {
            println!(
                "{} {} stage failed: {}",
                "✗".red(),
                failure.stage,
                failure.error
            );
        }
        println!("{}", "═".repeat(60).blue());
    }

    fn quote_flag(stale: bool, assumed: bool) -> String {
        if assumed {
            " (default)".yellow().to_string()
        } else if stale {
            " (stale)".yellow().to_string()
        } else {
            String::new()
        }
    }

    /// Format a signed percentage with color.
    fn format_pct_change(pct: f64) -> String {
        if pct >= 0.0 {
            format!("+{:.2}%", pct).green().to_string()
        } else {
            format!("{:.2}%", pct).red().to_string()
        }
    }

    fn format_sharpe(sharpe: Option<f64>) -> String {
        sharpe.map_or_else(|| "n/a".to_string(), |s| format!("{:.3}", s))
    }

    pub fn valuation_table(valuation: &Valuation) -> String {
        let mut builder = Builder::new();
        builder.push_record(["Symbol", "Name", "Shares", "Price", "Value USD", "Value JPY", "Ratio"]);
        for asset in &valuation.assets {
            let price = match asset.currency {
                Currency::Usd => format!("${:.2}", asset.price),
                Currency::Jpy => format!("¥{:.0}", asset.price),
            };
            builder.push_record([
                asset.symbol.clone(),
                asset.name.clone(),
                format!("{:.2}", asset.shares),
                price,
                format!("{:.2}", asset.value_usd),
                format!("{:.0}", asset.value_jpy),
                format!("{:.1}%", asset.ratio * 100.0),
            ]);
        }
        builder.build().with(Style::rounded()).to_string()
    }

    pub fn suggestions_table(suggestions: &[Suggestion]) -> String {
        let mut builder = Builder::new();
        builder.push_record(["Portfolio", "Return", "Volatility", "Sharpe", "Weights"]);
        for s in suggestions {
            builder.push_record([
                s.label.clone(),
                format!("{:.2}%", s.point.expected_return * 100.0),
                format!("{:.2}%", s.point.volatility * 100.0),
                Self::format_sharpe(s.point.sharpe),
                Self::format_weights(&s.point.weights),
            ]);
        }
        builder.build().with(Style::rounded()).to_string()
    }

    pub fn frontier_table(frontier: &[FrontierPoint]) -> String {
        let mut builder = Builder::new();
        builder.push_record(["#", "Return", "Volatility", "Sharpe", "Efficient"]);
        for (i, point) in frontier.iter().enumerate() {
            builder.push_record([
                (i + 1).to_string(),
                format!("{:.2}%", point.expected_return * 100.0),
                format!("{:.2}%", point.volatility * 100.0),
                Self::format_sharpe(point.sharpe),
                if point.efficient { "yes" } else { "" }.to_string(),
            ]);
        }
        builder.build().with(Style::rounded()).to_string()
    }

    fn format_weights(weights: &Allocation) -> String {
        weights
            .iter()
            .filter(|(_, w)| *w >= 0.005)
            .map(|(s, w)| format!("{} {:.0}%", s, w * 100.0))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn print_diagnostics(result: &OptimizationResult) {
        for dropped in &result.dropped {
            println!("  {} {}: {}", "Dropped".yellow(), dropped.symbol, dropped.reason);
        }
        for diagnostic in &result.diagnostics {
            println!("  {} {}", "Note:".yellow(), diagnostic);
        }
    }

    pub fn weights_table(current: Option<&Allocation>, target: &Allocation) -> String {
        let mut symbols: Vec<&str> = target.symbols().collect();
        if let Some(current) = current {
            for s in current.symbols() {
                if !target.contains(s) {
                    symbols.push(s);
                }
            }
        }
        symbols.sort_unstable();

        let mut builder = Builder::new();
        builder.push_record(["Symbol", "Current", "Target", "Change"]);
        for symbol in symbols {
            let cur = current.map_or(0.0, |c| c.weight(symbol));
            let tgt = target.weight(symbol);
            builder.push_record([
                symbol.to_string(),
                format!("{:.1}%", cur * 100.0),
                format!("{:.1}%", tgt * 100.0),
                Self::format_pct_change((tgt - cur) * 100.0),
            ]);
        }
        builder.build().with(Style::rounded()).to_string()
    }

    pub fn trades_table(trades: &[TradeInstruction]) -> String {
        if trades.is_empty() {
            return "No trades above the minimum trade value.".to_string();
        }
        let mut builder = Builder::new();
        builder.push_record(["#", "Action", "Symbol", "Amount", "Shares"]);
        for (i, trade) in trades.iter().enumerate() {
            let action = match trade.action {
                TradeAction::Buy => trade.action.to_string().green().to_string(),
                TradeAction::Sell => trade.action.to_string().red().to_string(),
            };
            builder.push_record([
                (i + 1).to_string(),
                action,
                trade.symbol.clone(),
                format!("{:+.2}", trade.amount),
                trade
                    .quantity
                    .map_or_else(|| "-".to_string(), |q| format!("{:+.2}", q)),
            ]);
        }
        builder.build().with(Style::rounded()).to_string()
    }

    pub fn scenarios_table(scenarios: &[ScenarioResult]) -> String {
        let mut builder = Builder::new();
        builder.push_record(["Market", "Portfolio", "Pessimistic", "Loss", "Remaining", "Top driver"]);
        for s in scenarios {
            let driver = s
                .assets
                .first()
                .map(|a| format!("{} (β {:.2})", a.symbol, a.beta))
                .unwrap_or_default();
            builder.push_record([
                format!("{:.0}%", s.shock_pct),
                format!("{:.2}%", s.portfolio_impact_pct),
                format!("{:.2}%", s.pessimistic_impact_pct),
                s.value_delta.map_or_else(String::new, |v| format!("{:.2}", v)),
                s.new_value().map_or_else(String::new, |v| format!("{:.2}", v)),
                driver,
            ]);
        }
        builder.build().with(Style::rounded()).to_string()
    }

    pub fn print_fx_stress(stress: &FxStressResult) {
        println!(
            "{}",
            format!(
                "FX Stress (equity {:+.0}%, USD/JPY {:+.0}%)",
                stress.equity_shock_pct, stress.fx_shock_pct
            )
            .bold()
            .underline()
        );
        println!(
            "  USD/JPY:  {:.2} → {:.2}",
            stress.usd_jpy, stress.stressed_usd_jpy
        );
        println!(
            "  Value:    ¥{:.0} → ¥{:.0}  {}",
            stress.value_jpy,
            stress.stressed_value_jpy,
            Self::format_pct_change(stress.change_pct)
        );
        println!();
    }

    /// Cached fields with their age and freshness.
    pub fn cache_table(entries: &[CachedField], settings: &crate::config::CacheSettings) -> String {
        let now = Utc::now();
        let mut builder = Builder::new();
        builder.push_record(["Symbol", "Field", "Class", "Age", "Fresh", "Value"]);
        for entry in entries {
            let age = entry.age(now);
            let age = if age.num_hours() >= 1 {
                format!("{}h", age.num_hours())
            } else {
                format!("{}m", age.num_minutes())
            };
            builder.push_record([
                entry.symbol.clone(),
                entry.field.clone(),
                entry.class.to_string(),
                age,
                if entry.is_fresh(settings, now) {
                    "yes".green().to_string()
                } else {
                    "stale".yellow().to_string()
                },
                entry.value.summary(),
            ]);
        }
        builder.build().with(Style::rounded()).to_string()
    }

    /// Export a report to JSON.
    pub fn to_json(report: &PortfolioReport) -> String {
        serde_json::to_string_pretty(report).unwrap_or_else(|_| "{}".to_string())
    }
}
