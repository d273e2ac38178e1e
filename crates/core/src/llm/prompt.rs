use crate::llm::GenerationRequest;
use crate::market::types::Candle;
use chrono::{DateTime, Utc};

/// Number of most recent candles embedded in the prompt.
pub const PROMPT_CANDLE_WINDOW: usize = 50;

pub fn recent_candles(candles: &[Candle]) -> &[Candle] {
    &candles[candles.len().saturating_sub(PROMPT_CANDLE_WINDOW)..]
}

pub fn build_prompt(request: &GenerationRequest) -> String {
    let symbol = request.symbol.trim().to_uppercase();
    let timeframe = request.timeframe;
    let candles = serialize_candles(recent_candles(&request.candles));
    let funding_rate = &request.funding_rate;
    let long_short_ratio = &request.long_short_ratio;

    format!(
        "Anda adalah seorang Analis Kripto Profesional dan Trader Ahli.
Gaya bahasa Anda lugas, percaya diri, dan langsung ke intinya. Tugas Anda adalah memberikan analisis teknikal yang tajam dan actionable untuk pasangan {symbol}/USDT dengan timeframe {timeframe}.

**Data Pasar:**
Candle OHLCV terbaru (UTC, terlama ke terbaru):
{candles}
Funding Rate: {funding_rate}
Long/Short Ratio: {long_short_ratio}

**Instruksi Penting:**
1.  Isi template laporan di bawah ini dengan analisis Anda dalam format Markdown.
2.  Berikan angka yang **spesifik, jelas, dan realistis** untuk setiap level harga.
3.  Gunakan format `$[harga]` untuk semua harga (contoh: `$65,123.45`).
4.  **JANGAN PERNAH** mengubah struktur atau format dari template laporan ini.
5.  Tentukan apakah sinyal cenderung 'Long' atau 'Short' berdasarkan analisis Anda.

--- TEMPLATE LAPORAN ---
📊 Analisis Profesional: {symbol}/USDT ({timeframe})

Rekomendasi Sinyal: `[Tulis Long atau Short di sini]`

---
🎯 Target Entry:
• Entry Price: `$[harga_entry]`

🛡️ Manajemen Risiko:
• Stop Loss: `$[harga_sl]`

💰 Target Keuntungan (Take Profit):
• TP 1: `$[harga_tp1]`
• TP 2: `$[harga_tp2]`
• TP 3: `$[harga_tp3]`

---
📝 Ringkasan Analisis

🕯️ Analisa Candle & Chart Pattern:
[Berikan analisis ringkas dan padat di sini. Sebutkan pola candlestick atau chart pattern utama yang teridentifikasi (misal: Bullish Engulfing, Head and Shoulders, Rising Wedge) dan apa implikasinya.]

📈 Analisa Data Pasar (Sentimen):
[Berikan analisis singkat mengenai sentimen pasar berdasarkan Funding Rate dan Long/Short Ratio.]
"
    )
}

/// One header row plus one CSV row per candle.
fn serialize_candles(candles: &[Candle]) -> String {
    let mut out = String::from("time,open,high,low,close,volume\n");
    for c in candles {
        let time = DateTime::<Utc>::from_timestamp_millis(c.time)
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| c.time.to_string());
        out.push_str(&format!(
            "{time},{},{},{},{},{}\n",
            c.open, c.high, c.low, c.close, c.volume
        ));
    }
    out
}
