use serde::Deserialize;

/// `/iserver/secdef/search` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct IbContract {
    #[serde(rename = "conid")]
    pub contract_id: i64,
    pub symbol: Option<String>,
    #[serde(rename = "companyName")]
    pub company_name: Option<String>,
    #[serde(rename = "secType")]
    pub sec_type: Option<String>,
    pub exchange: Option<String>,
    pub currency: Option<String>,
}

/// `/iserver/auth/status` payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IbAuthStatus {
    #[serde(default)]
    pub authenticated: bool,
    #[serde(default)]
    pub connected: bool,
    /// True when another session holds the same client id.
    #[serde(default)]
    pub competing: bool,
}

/// One bar from `/iserver/marketdata/history`.
#[derive(Debug, Clone, Deserialize)]
pub struct IbHistoryBar {
    /// Epoch milliseconds.
    pub t: i64,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    #[serde(default)]
    pub v: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IbHistoryResponse {
    #[serde(default)]
    pub data: Vec<IbHistoryBar>,
    #[serde(rename = "mdAvailability")]
    pub md_availability: Option<String>,
}
