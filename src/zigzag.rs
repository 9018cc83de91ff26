//! ZigZag Labeler.
//!
//! Forward-looking classification of each bar relative to a future
//! fractional price swing, anchored on close prices: within `lookahead`
//! bars, does price first move up by `threshold` (BUY), down by `threshold`
//! (SELL), or neither (HOLD)?

use crate::data::BarFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    Buy,
    Hold,
    Sell,
}

impl Label {
    /// Index into [`crate::training::network::CLASSES`], which fixes the
    /// same BUY/HOLD/SELL order.
    pub fn class_index(self) -> usize {
        match self {
            Self::Buy => 0,
            Self::Hold => 1,
            Self::Sell => 2,
        }
    }
}

/// Anchor `i`'s close is compared against the high/low of
/// `bars[i+1 ..= i+lookahead]`. Anchors with fewer than `lookahead` remaining
/// bars get `Hold` — there isn't enough runway left to confirm a swing.
pub fn generate(frame: &BarFrame, threshold: f64, lookahead: usize) -> Vec<Label> {
    let bars = frame.bars();
    let n = bars.len();
    let mut labels = vec![Label::Hold; n];
    if n == 0 || lookahead == 0 {
        return labels;
    }

    for i in 0..n {
        let remaining = n - 1 - i;
        if remaining < lookahead {
            continue;
        }
        let anchor = bars[i].close;
        let up_level = anchor * (1.0 + threshold);
        let down_level = anchor * (1.0 - threshold);

        let mut buy_offset = None;
        let mut sell_offset = None;
        for offset in 1..=lookahead {
            let bar = &bars[i + offset];
            if buy_offset.is_none() && bar.high > up_level {
                buy_offset = Some(offset);
            }
            if sell_offset.is_none() && bar.low < down_level {
                sell_offset = Some(offset);
            }
            if buy_offset.is_some() && sell_offset.is_some() {
                break;
            }
        }

        labels[i] = match (buy_offset, sell_offset) {
            (Some(b), Some(s)) if b <= s => Label::Buy,
            (Some(_), Some(_)) => Label::Sell,
            (Some(_), None) => Label::Buy,
            (None, Some(_)) => Label::Sell,
            (None, None) => Label::Hold,
        };
    }

    labels
}
