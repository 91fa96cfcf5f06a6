// redwall/src/pricing.rs
//
// Static model pricing. Rates are stored in hundred-nanodollars per token
// (1 unit = 1e-8 USD) so per-call cost is exact at 8 decimals; float math
// would wobble at the truncation boundary. Unknown models fall back to the
// gpt-4o rates.

/// (model, input rate, output rate) — units of 1e-8 USD per token.
const RATES: &[(&str, u64, u64)] = &[
    // OpenAI
    ("gpt-4o",                      250,  1_000),
    ("gpt-4o-mini",                  15,     60),
    ("gpt-4-turbo",               1_000,  3_000),
    ("gpt-4",                     3_000,  6_000),
    ("gpt-3.5-turbo",                50,    150),
    ("o1",                        1_500,  6_000),
    ("o1-mini",                     110,    440),
    ("o3-mini",                     110,    440),
    // Anthropic
    ("claude-3-5-sonnet-20241022",  300,  1_500),
    ("claude-3-5-sonnet-latest",    300,  1_500),
    ("claude-3-5-haiku-20241022",    80,    400),
    ("claude-3-opus-20240229",    1_500,  7_500),
    ("claude-3-sonnet-20240229",    300,  1_500),
    ("claude-3-haiku-20240307",      25,    125),
];

const DEFAULT_RATES: (u64, u64) = (250, 1_000); // gpt-4o

fn rates_for(model: &str) -> (u64, u64) {
    if let Some(&(_, i, o)) = RATES.iter().find(|(m, _, _)| *m == model) {
        return (i, o);
    }
    // Dated/suffixed variants (e.g. "gpt-4o-2024-08-06") use the base rates.
    if let Some(&(_, i, o)) = RATES
        .iter()
        .filter(|(m, _, _)| model.starts_with(m))
        .max_by_key(|(m, _, _)| m.len())
    {
        return (i, o);
    }
    DEFAULT_RATES
}

/// Cost of one call in 1e-8 USD units.
pub fn cost_units(model: &str, prompt_tokens: u32, completion_tokens: u32) -> u64 {
    let (input_rate, output_rate) = rates_for(model);
    prompt_tokens as u64 * input_rate + completion_tokens as u64 * output_rate
}

/// USD cost of one call, exact to 8 decimals.
pub fn cost(model: &str, prompt_tokens: u32, completion_tokens: u32) -> f64 {
    cost_units(model, prompt_tokens, completion_tokens) as f64 / 1e8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_cost() {
        // 1000 in + 500 out on gpt-4o: 1000*2.5e-6 + 500*1e-5 = 0.0075
        assert_eq!(cost_units("gpt-4o", 1000, 500), 750_000);
        assert_eq!(cost("gpt-4o", 1000, 500), 0.0075);
    }

    #[test]
    fn unknown_model_uses_default_rates() {
        assert_eq!(cost("my-custom-model", 1234, 567), cost("gpt-4o", 1234, 567));
        // p·2.5e-6 + c·1e-5 in units: 1234*250 + 567*1000
        assert_eq!(cost_units("my-custom-model", 1234, 567), 875_500);
    }

    #[test]
    fn dated_variant_uses_base_rates() {
        assert_eq!(
            cost_units("gpt-4o-2024-08-06", 100, 100),
            cost_units("gpt-4o", 100, 100)
        );
        // Longest prefix wins over the shorter gpt-4o entry.
        assert_eq!(
            cost_units("gpt-4o-mini-2024-07-18", 100, 0),
            cost_units("gpt-4o-mini", 100, 0)
        );
    }

    #[test]
    fn single_token_resolves_exactly() {
        assert_eq!(cost("gpt-4o-mini", 1, 0), 0.00000015);
    }

    #[test]
    fn zero_tokens_zero_cost() {
        assert_eq!(cost("gpt-4o", 0, 0), 0.0);
    }
}
