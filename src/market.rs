// ===============================
// src/market.rs
// ===============================
//
// Static market reference data: species price tiers, harbor table,
// buyer directory. Pure lookup, no logic beyond fuzzy matching and the
// fuel/price arithmetic. Prices are Kerala wholesale, INR.
//

use once_cell::sync::Lazy;
use serde::Serialize;

use crate::domain::HarborOption;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceTier {
    Premium,
    Bulk,
    ExportGrade,
    Standard,
}

#[derive(Debug, Clone)]
pub struct FishSpecies {
    pub id: &'static str,
    pub english: &'static str,
    pub malayalam: &'static str,
    pub tamil: &'static str,
    pub hindi: &'static str,
    pub tier: PriceTier,
    pub retail_price: i64,
    pub wholesale_price: i64,
    pub farmgate_price: i64,
    pub target_price: i64,
    pub perishability_hours: u32,
    pub cold_storage_per_day: i64,
}

pub static FISH_SPECIES: Lazy<Vec<FishSpecies>> = Lazy::new(|| {
    vec![
        FishSpecies {
            id: "karimeen",
            english: "Pearl Spot",
            malayalam: "കരിമീൻ",
            tamil: "கருவாலி",
            hindi: "करीमीन",
            tier: PriceTier::Premium,
            retail_price: 600,
            wholesale_price: 380,
            farmgate_price: 220,
            target_price: 340,
            perishability_hours: 8,
            cold_storage_per_day: 500,
        },
        FishSpecies {
            id: "sardine",
            english: "Sardine",
            malayalam: "മത്തി",
            tamil: "மத்தி மீன்",
            hindi: "तारली",
            tier: PriceTier::Bulk,
            retail_price: 200,
            wholesale_price: 120,
            farmgate_price: 60,
            target_price: 95,
            perishability_hours: 4,
            cold_storage_per_day: 500,
        },
        FishSpecies {
            id: "prawns",
            english: "Tiger Prawns",
            malayalam: "ചെമ്മീൻ",
            tamil: "இறால்",
            hindi: "झींगा",
            tier: PriceTier::Premium,
            retail_price: 500,
            wholesale_price: 320,
            farmgate_price: 180,
            target_price: 280,
            perishability_hours: 6,
            cold_storage_per_day: 600,
        },
        FishSpecies {
            id: "king_mackerel",
            english: "King Mackerel",
            malayalam: "നെയ്‌മീൻ",
            tamil: "வஞ்சிரம்",
            hindi: "सुरमई",
            tier: PriceTier::Premium,
            retail_price: 700,
            wholesale_price: 450,
            farmgate_price: 280,
            target_price: 400,
            perishability_hours: 10,
            cold_storage_per_day: 500,
        },
        FishSpecies {
            id: "pomfret",
            english: "Silver Pomfret",
            malayalam: "ആവോലി",
            tamil: "வாவல் மீன்",
            hindi: "पापलेट",
            tier: PriceTier::Premium,
            retail_price: 600,
            wholesale_price: 400,
            farmgate_price: 250,
            target_price: 360,
            perishability_hours: 10,
            cold_storage_per_day: 500,
        },
        FishSpecies {
            id: "red_snapper",
            english: "Red Snapper",
            malayalam: "ചെമ്പല്ലി",
            tamil: "சங்கரா மீன்",
            hindi: "लाल मछली",
            tier: PriceTier::Standard,
            retail_price: 350,
            wholesale_price: 200,
            farmgate_price: 110,
            target_price: 175,
            perishability_hours: 8,
            cold_storage_per_day: 500,
        },
        FishSpecies {
            id: "mackerel",
            english: "Indian Mackerel",
            malayalam: "അയല",
            tamil: "அயிலை மீன்",
            hindi: "बांगड़ा",
            tier: PriceTier::Bulk,
            retail_price: 300,
            wholesale_price: 160,
            farmgate_price: 80,
            target_price: 130,
            perishability_hours: 4,
            cold_storage_per_day: 500,
        },
        FishSpecies {
            id: "tuna",
            english: "Yellowfin Tuna",
            malayalam: "ചൂര",
            tamil: "சூரை மீன்",
            hindi: "टूना",
            tier: PriceTier::ExportGrade,
            retail_price: 500,
            wholesale_price: 350,
            farmgate_price: 200,
            target_price: 310,
            perishability_hours: 12,
            cold_storage_per_day: 700,
        },
    ]
});

#[derive(Debug, Clone)]
pub struct Harbor {
    pub id: &'static str,
    pub name: &'static str,
    pub distance_km: u32,
    pub transit_min: u32,
    pub cold_storage_fee: i64,
    pub speciality: &'static str,
}

// Distances from Kadamakudy; first entry is the recommended default.
pub static HARBORS: Lazy<Vec<Harbor>> = Lazy::new(|| {
    vec![
        Harbor {
            id: "kochi_harbor",
            name: "Kochi Fishing Harbor",
            distance_km: 12,
            transit_min: 45,
            cold_storage_fee: 500,
            speciality: "Export-grade buyers, premium wholesale",
        },
        Harbor {
            id: "vypin",
            name: "Vypin Harbor",
            distance_km: 8,
            transit_min: 30,
            cold_storage_fee: 0,
            speciality: "Local retail, restaurants",
        },
        Harbor {
            id: "fort_kochi",
            name: "Fort Kochi Landing",
            distance_km: 10,
            transit_min: 35,
            cold_storage_fee: 0,
            speciality: "Tourist restaurants, premium hotels",
        },
        Harbor {
            id: "munambam",
            name: "Munambam Harbor",
            distance_km: 28,
            transit_min: 90,
            cold_storage_fee: 400,
            speciality: "Bulk sardine/mackerel buyers",
        },
        Harbor {
            id: "chellanam",
            name: "Chellanam Harbor",
            distance_km: 15,
            transit_min: 55,
            cold_storage_fee: 350,
            speciality: "Prawns specialist market",
        },
    ]
});

#[derive(Debug, Clone)]
pub struct Buyer {
    pub id: &'static str,
    pub name: &'static str,
    pub channel: &'static str,
    pub kind: &'static str,
    pub aggressiveness: f64,
    /// Typical bid as a fraction of the mandi average (lo, hi).
    pub bid_range: (f64, f64),
    pub location: &'static str,
    pub specialty: &'static str,
}

pub static BUYERS: Lazy<Vec<Buyer>> = Lazy::new(|| {
    vec![
        Buyer {
            id: "KFE",
            name: "Kochi Fresh Exports",
            channel: "whatsapp",
            kind: "export",
            aggressiveness: 0.8,
            bid_range: (0.85, 0.95),
            location: "Thoppumpady, Kochi",
            specialty: "Export to Gulf countries",
        },
        Buyer {
            id: "MWS",
            name: "Marina Wholesale Seafood",
            channel: "whatsapp",
            kind: "wholesale",
            aggressiveness: 0.6,
            bid_range: (0.9, 1.05),
            location: "Mattancherry, Kochi",
            specialty: "Premium hotel supply chain",
        },
        Buyer {
            id: "PKF",
            name: "Paravur Kadal Foods",
            channel: "whatsapp",
            kind: "processor",
            aggressiveness: 0.7,
            bid_range: (0.8, 0.92),
            location: "Paravur",
            specialty: "Fish processing & packaging",
        },
        Buyer {
            id: "HKC",
            name: "Hotel Kerala Cafe Chain",
            channel: "telegram",
            kind: "hospitality",
            aggressiveness: 0.4,
            bid_range: (0.7, 0.85),
            location: "Ernakulam",
            specialty: "Restaurant chain, daily supply",
        },
        Buyer {
            id: "SCM",
            name: "Saravana Canteen & Mess",
            channel: "telegram",
            kind: "canteen",
            aggressiveness: 0.3,
            bid_range: (0.6, 0.75),
            location: "Kalamassery",
            specialty: "Bulk hostel/canteen supply",
        },
        Buyer {
            id: "VFS",
            name: "Vypeen Fresh Stall",
            channel: "telegram",
            kind: "retail",
            aggressiveness: 0.5,
            bid_range: (0.75, 0.88),
            location: "Vypin Island",
            specialty: "Local retail, walk-in customers",
        },
        Buyer {
            id: "GGE",
            name: "Gulf Gate Exports Pvt Ltd",
            channel: "whatsapp",
            kind: "export",
            aggressiveness: 0.9,
            bid_range: (0.95, 1.1),
            location: "Willingdon Island, Kochi",
            specialty: "Air-freight to Dubai & Saudi",
        },
    ]
});

// Fuel constants (Kerala marine diesel).
pub const MARINE_DIESEL_PER_LITRE: f64 = 92.0;
pub const BOAT_CONSUMPTION_L_PER_KM: f64 = 0.65;

/// One-way fuel cost to a harbor, rupees.
pub fn fuel_cost(distance_km: u32) -> i64 {
    (distance_km as f64 * BOAT_CONSUMPTION_L_PER_KM * MARINE_DIESEL_PER_LITRE).round() as i64
}

/// The harbor table as presented to clients (fuel precomputed).
pub fn harbor_options() -> Vec<HarborOption> {
    HARBORS
        .iter()
        .map(|h| HarborOption {
            name: h.name.to_string(),
            distance_km: h.distance_km,
            fuel_cost: fuel_cost(h.distance_km),
            eta_minutes: h.transit_min,
        })
        .collect()
}

/// Case-insensitive species match on id, English name, or a local name.
pub fn find_species(name: &str) -> Option<&'static FishSpecies> {
    let needle = name.trim().to_lowercase();
    if needle.is_empty() {
        return None;
    }
    FISH_SPECIES.iter().find(|f| {
        f.id == needle
            || f.english.to_lowercase().contains(&needle)
            || f.malayalam == name.trim()
            || f.tamil == name.trim()
            || f.hindi == name.trim()
    })
}

/// Fuzzy harbor match, `None` when nothing in the table resembles `name`.
pub fn find_harbor(name: &str) -> Option<&'static Harbor> {
    let needle = name.trim().to_lowercase();
    if needle.is_empty() {
        return None;
    }
    HARBORS
        .iter()
        .find(|h| h.name.to_lowercase().contains(&needle) || h.id.contains(&needle))
}

pub fn find_buyer(id: &str) -> Option<&'static Buyer> {
    BUYERS.iter().find(|b| b.id.eq_ignore_ascii_case(id.trim()))
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MandiPrice {
    pub average: i64,
    pub min: i64,
    pub max: i64,
    /// False when the species was unknown and the price was synthesized
    /// from the quality score.
    pub from_table: bool,
}

/// Market price triple for a species. Unknown species fall back to a
/// quality-score synthesis (premium lots quote higher).
pub fn mandi_price(species: &str, quality_score: u8) -> MandiPrice {
    match find_species(species) {
        Some(f) => MandiPrice {
            average: f.wholesale_price,
            min: f.wholesale_price - 40,
            max: f.wholesale_price + 60,
            from_table: true,
        },
        None => {
            let base = if quality_score >= 90 {
                440
            } else if quality_score >= 75 {
                400
            } else {
                350
            };
            MandiPrice { average: base, min: base - 40, max: base + 60, from_table: false }
        }
    }
}
