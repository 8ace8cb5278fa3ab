//! Static per-city metro adjacency and station-name normalization.
//!
//! Lines are listed in travel order; adjacency is derived from consecutive
//! stations plus explicit transfers between differently named stations.
//! Names are compared only after [`normalize_station`], so tables and
//! listings may use any casing, `ё`/`е` spelling or abbreviation.

use crate::listing::address::Region;
use regex::Regex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::OnceLock;

type Graph = HashMap<String, BTreeSet<String>>;

struct Line {
    stations: &'static [&'static str],
    circular: bool,
}

const fn line(stations: &'static [&'static str]) -> Line {
    Line {
        stations,
        circular: false,
    }
}

const MOSCOW_LINES: &[Line] = &[
    line(&[
        "Бульвар Рокоссовского", "Черкизовская", "Преображенская площадь", "Сокольники",
        "Красносельская", "Комсомольская", "Красные Ворота", "Чистые пруды", "Лубянка",
        "Охотный Ряд", "Библиотека имени Ленина", "Кропоткинская", "Парк культуры",
        "Фрунзенская", "Спортивная", "Воробьёвы горы", "Университет", "Проспект Вернадского",
        "Юго-Западная", "Тропарёво", "Румянцево", "Саларьево", "Филатов Луг", "Прокшино",
        "Ольховая", "Коммунарка", "Потапово",
    ]),
    line(&[
        "Ховрино", "Беломорская", "Речной вокзал", "Водный стадион", "Войковская", "Сокол",
        "Аэропорт", "Динамо", "Белорусская", "Маяковская", "Тверская", "Театральная",
        "Новокузнецкая", "Павелецкая", "Автозаводская", "Технопарк", "Коломенская",
        "Каширская", "Кантемировская", "Царицыно", "Орехово", "Домодедовская",
        "Красногвардейская", "Алма-Атинская",
    ]),
    line(&[
        "Пятницкое шоссе", "Митино", "Волоколамская", "Мякинино", "Строгино", "Крылатское",
        "Молодёжная", "Кунцевская", "Славянский бульвар", "Парк Победы", "Киевская",
        "Смоленская", "Арбатская", "Площадь Революции", "Курская", "Бауманская",
        "Электрозаводская", "Семёновская", "Партизанская", "Измайловская", "Первомайская",
        "Щёлковская",
    ]),
    line(&[
        "Александровский сад", "Арбатская", "Смоленская", "Киевская", "Студенческая",
        "Кутузовская", "Фили", "Багратионовская", "Филёвский парк", "Пионерская", "Кунцевская",
    ]),
    line(&["Киевская", "Выставочная", "Международная"]),
    Line {
        stations: &[
            "Парк культуры", "Октябрьская", "Добрынинская", "Павелецкая", "Таганская", "Курская",
            "Комсомольская", "Проспект Мира", "Новослободская", "Белорусская",
            "Краснопресненская", "Киевская",
        ],
        circular: true,
    },
    line(&[
        "Медведково", "Бабушкинская", "Свиблово", "Ботанический сад", "ВДНХ", "Алексеевская",
        "Рижская", "Проспект Мира", "Сухаревская", "Тургеневская", "Китай-город",
        "Третьяковская", "Октябрьская", "Шаболовская", "Ленинский проспект", "Академическая",
        "Профсоюзная", "Новые Черёмушки", "Калужская", "Беляево", "Коньково", "Тёплый Стан",
        "Ясенево", "Новоясеневская",
    ]),
    line(&[
        "Планерная", "Сходненская", "Тушинская", "Спартак", "Щукинская", "Октябрьское поле",
        "Полежаевская", "Беговая", "Улица 1905 года", "Баррикадная", "Пушкинская",
        "Кузнецкий Мост", "Китай-город", "Таганская", "Пролетарская", "Волгоградский проспект",
        "Текстильщики", "Кузьминки", "Рязанский проспект", "Выхино", "Лермонтовский проспект",
        "Жулебино", "Котельники",
    ]),
    line(&[
        "Новокосино", "Новогиреево", "Перово", "Шоссе Энтузиастов", "Авиамоторная",
        "Площадь Ильича", "Марксистская", "Третьяковская",
    ]),
    line(&[
        "Алтуфьево", "Бибирево", "Отрадное", "Владыкино", "Петровско-Разумовская",
        "Тимирязевская", "Дмитровская", "Савёловская", "Менделеевская", "Цветной бульвар",
        "Чеховская", "Боровицкая", "Полянка", "Серпуховская", "Тульская", "Нагатинская",
        "Нагорная", "Нахимовский проспект", "Севастопольская", "Чертановская", "Южная",
        "Пражская", "Улица Академика Янгеля", "Аннино", "Бульвар Дмитрия Донского",
    ]),
    line(&[
        "Физтех", "Лианозово", "Яхромская", "Селигерская", "Верхние Лихоборы", "Окружная",
        "Петровско-Разумовская", "Фонвизинская", "Бутырская", "Марьина Роща", "Достоевская",
        "Трубная", "Сретенский бульвар", "Чкаловская", "Римская", "Крестьянская застава",
        "Дубровка", "Кожуховская", "Печатники", "Волжская", "Люблино", "Братиславская",
        "Марьино", "Борисово", "Шипиловская", "Зябликово",
    ]),
];

const MOSCOW_TRANSFERS: &[(&str, &str)] = &[
    ("Охотный Ряд", "Театральная"),
    ("Театральная", "Площадь Революции"),
    ("Библиотека имени Ленина", "Арбатская"),
    ("Библиотека имени Ленина", "Боровицкая"),
    ("Библиотека имени Ленина", "Александровский сад"),
    ("Пушкинская", "Тверская"),
    ("Пушкинская", "Чеховская"),
    ("Тверская", "Чеховская"),
    ("Лубянка", "Кузнецкий Мост"),
    ("Чистые пруды", "Тургеневская"),
    ("Чистые пруды", "Сретенский бульвар"),
    ("Новокузнецкая", "Третьяковская"),
    ("Добрынинская", "Серпуховская"),
    ("Марксистская", "Таганская"),
    ("Пролетарская", "Крестьянская застава"),
    ("Римская", "Площадь Ильича"),
    ("Менделеевская", "Новослободская"),
    ("Краснопресненская", "Баррикадная"),
    ("Цветной бульвар", "Трубная"),
];

const SPB_LINES: &[Line] = &[
    line(&[
        "Девяткино", "Гражданский проспект", "Академическая", "Политехническая",
        "Площадь Мужества", "Лесная", "Выборгская", "Площадь Ленина", "Чернышевская",
        "Площадь Восстания", "Владимирская", "Пушкинская", "Технологический институт",
        "Балтийская", "Нарвская", "Кировский завод", "Автово", "Ленинский проспект",
        "Проспект Ветеранов",
    ]),
    line(&[
        "Парнас", "Проспект Просвещения", "Озерки", "Удельная", "Пионерская", "Чёрная речка",
        "Петроградская", "Горьковская", "Невский проспект", "Сенная площадь",
        "Технологический институт", "Фрунзенская", "Московские ворота", "Электросила",
        "Парк Победы", "Московская", "Звёздная", "Купчино",
    ]),
    line(&[
        "Беговая", "Зенит", "Приморская", "Василеостровская", "Гостиный двор", "Маяковская",
        "Площадь Александра Невского", "Елизаровская", "Ломоносовская", "Пролетарская",
        "Обухово", "Рыбацкое",
    ]),
    line(&[
        "Спасская", "Достоевская", "Лиговский проспект", "Площадь Александра Невского",
        "Новочеркасская", "Ладожская", "Проспект Большевиков", "Улица Дыбенко",
    ]),
    line(&[
        "Комендантский проспект", "Старая Деревня", "Крестовский остров", "Чкаловская",
        "Спортивная", "Адмиралтейская", "Садовая", "Звенигородская", "Обводный канал",
        "Волковская", "Бухарестская", "Международная", "Проспект Славы", "Дунайская", "Шушары",
    ]),
];

const SPB_TRANSFERS: &[(&str, &str)] = &[
    ("Невский проспект", "Гостиный двор"),
    ("Площадь Восстания", "Маяковская"),
    ("Сенная площадь", "Садовая"),
    ("Сенная площадь", "Спасская"),
    ("Садовая", "Спасская"),
    ("Владимирская", "Достоевская"),
    ("Пушкинская", "Звенигородская"),
];

/// Canonical station name used for every adjacency lookup.
///
/// Lowercases, folds `ё` to `е`, strips metro prefixes, parenthesized notes
/// and walking-time suffixes, expands common abbreviations and turns
/// hyphens and dashes into spaces.
pub fn normalize_station(name: &str) -> String {
    static PARENS: OnceLock<Option<Regex>> = OnceLock::new();
    static WALK: OnceLock<Option<Regex>> = OnceLock::new();
    let parens = PARENS.get_or_init(|| Regex::new(r"\([^)]*\)").ok());
    let walk = WALK.get_or_init(|| Regex::new(r"\s\d+\s*(?:мин|min)\.?.*$").ok());

    let lowered = name.to_lowercase().replace('ё', "е");
    let mut cleaned = lowered.split(',').next().unwrap_or_default().to_string();
    if let Some(parens) = parens {
        cleaned = parens.replace_all(&cleaned, " ").into_owned();
    }
    if let Some(walk) = walk {
        cleaned = walk.replace(&cleaned, "").into_owned();
    }

    let mut words: Vec<String> = Vec::new();
    for raw in cleaned.split_whitespace() {
        if words.is_empty() && matches!(raw, "м." | "м" | "метро" | "ст." | "ст" | "станция") {
            continue;
        }
        let expanded = match raw {
            "пр-т" | "просп." | "просп" | "пр." | "пр" => "проспект",
            "ул." | "ул" => "улица",
            "пл." | "пл" => "площадь",
            "б-р" | "бул." | "бульв." => "бульвар",
            "ш." => "шоссе",
            "им." => "имени",
            other => other,
        };
        words.push(expanded.to_string());
    }

    words
        .join(" ")
        .chars()
        .map(|c| if matches!(c, '-' | '–' | '—') { ' ' } else { c })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn build_graph(lines: &[Line], transfers: &[(&str, &str)]) -> Graph {
    let mut graph = Graph::new();
    let mut link = |a: &str, b: &str| {
        let (a, b) = (normalize_station(a), normalize_station(b));
        if a == b {
            return;
        }
        graph.entry(a.clone()).or_default().insert(b.clone());
        graph.entry(b).or_default().insert(a);
    };
    for line in lines {
        for pair in line.stations.windows(2) {
            link(pair[0], pair[1]);
        }
        if line.circular && line.stations.len() > 2 {
            if let (Some(first), Some(last)) = (line.stations.first(), line.stations.last()) {
                link(last, first);
            }
        }
    }
    for (a, b) in transfers {
        link(a, b);
    }
    graph
}

fn graph_for(region: &Region) -> Option<&'static Graph> {
    static MOSCOW: OnceLock<Graph> = OnceLock::new();
    static SPB: OnceLock<Graph> = OnceLock::new();
    match region {
        Region::Moscow | Region::MoscowOblast => {
            Some(MOSCOW.get_or_init(|| build_graph(MOSCOW_LINES, MOSCOW_TRANSFERS)))
        }
        Region::SaintPetersburg | Region::LeningradOblast => {
            Some(SPB.get_or_init(|| build_graph(SPB_LINES, SPB_TRANSFERS)))
        }
        Region::Other(_) => None,
    }
}

/// Stations one hop away from `station`, normalized. Empty when the city or
/// the station is unknown.
pub fn adjacent_stations(region: &Region, station: &str) -> BTreeSet<String> {
    graph_for(region)
        .and_then(|g| g.get(&normalize_station(station)))
        .cloned()
        .unwrap_or_default()
}

/// Union of the one-hop neighbors of every station in `stops`, without the
/// stations themselves.
pub fn one_hop(region: &Region, stops: &[String]) -> HashSet<String> {
    let own: HashSet<String> = stops.iter().map(|s| normalize_station(s)).collect();
    stops
        .iter()
        .flat_map(|s| adjacent_stations(region, s))
        .filter(|s| !own.contains(s))
        .collect()
}
