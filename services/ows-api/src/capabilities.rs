//! Capability, describe and execute documents, filled from the namespace
//! configuration.

use chrono::{DateTime, Utc};

use ows_common::config::{Config, Layer, Process};

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn ows_url(conf: &Config) -> String {
    let ns = &conf.service_config.namespace;
    let host = if conf.service_config.ows_hostname.is_empty() {
        "localhost:8080"
    } else {
        &conf.service_config.ows_hostname
    };
    if ns.is_empty() || ns == "." {
        format!("http://{}/ows", host)
    } else {
        format!("http://{}/ows/{}", host, ns)
    }
}

fn layer_dates_csv(layer: &Layer, now: DateTime<Utc>) -> String {
    layer.refreshed_dates(now).join(",")
}

fn wms_layer_xml(layer: &Layer, now: DateTime<Utc>) -> String {
    let styles: String = layer
        .styles
        .iter()
        .map(|s| {
            format!(
                "<Style><Name>{}</Name><Title>{}</Title></Style>",
                xml_escape(&s.name),
                xml_escape(if s.title.is_empty() { &s.name } else { &s.title }),
            )
        })
        .collect();

    let dates = layer_dates_csv(layer, now);
    let default_date = layer
        .refreshed_dates(now)
        .last()
        .cloned()
        .unwrap_or_default();

    format!(
        concat!(
            r#"<Layer queryable="1">"#,
            "<Name>{name}</Name><Title>{title}</Title><Abstract>{abstract_}</Abstract>",
            "<CRS>EPSG:4326</CRS><CRS>EPSG:3857</CRS><CRS>CRS:84</CRS>",
            "<EX_GeographicBoundingBox>",
            "<westBoundLongitude>-180</westBoundLongitude><eastBoundLongitude>180</eastBoundLongitude>",
            "<southBoundLatitude>-90</southBoundLatitude><northBoundLatitude>90</northBoundLatitude>",
            "</EX_GeographicBoundingBox>",
            r#"<BoundingBox CRS="EPSG:4326" minx="-180" miny="-90" maxx="180" maxy="90"/>"#,
            "{styles}",
            r#"<Dimension name="time" units="ISO8601" default="{default_date}">{dates}</Dimension>"#,
            "</Layer>"
        ),
        name = xml_escape(&layer.name),
        title = xml_escape(&layer.title),
        abstract_ = xml_escape(&layer.abstract_),
        styles = styles,
        default_date = default_date,
        dates = dates,
    )
}

/// The WMS capabilities document; the 1.1.1 variant differs in its root
/// element and SRS tag naming.
pub fn wms_capabilities(conf: &Config, version: &str, now: DateTime<Utc>) -> String {
    let layers: String = conf.layers.iter().map(|l| wms_layer_xml(l, now)).collect();
    let url = ows_url(conf);

    if version == "1.1.1" {
        return format!(
            concat!(
                r#"<?xml version="1.0" encoding="UTF-8"?>"#,
                r#"<WMT_MS_Capabilities version="1.1.1">"#,
                "<Service><Name>OGC:WMS</Name><Title>Geospatial Web Service</Title>",
                r#"<OnlineResource xmlns:xlink="http://www.w3.org/1999/xlink" xlink:href="{url}"/>"#,
                "</Service><Capability><Request>",
                r#"<GetCapabilities><Format>application/vnd.ogc.wms_xml</Format><DCPType><HTTP><Get><OnlineResource xmlns:xlink="http://www.w3.org/1999/xlink" xlink:href="{url}?"/></Get></HTTP></DCPType></GetCapabilities>"#,
                r#"<GetMap><Format>image/png</Format><DCPType><HTTP><Get><OnlineResource xmlns:xlink="http://www.w3.org/1999/xlink" xlink:href="{url}?"/></Get></HTTP></DCPType></GetMap>"#,
                "</Request><Exception><Format>text/plain</Format></Exception>",
                "<Layer><Title>Geospatial Data</Title><SRS>EPSG:4326</SRS>{layers}</Layer>",
                "</Capability></WMT_MS_Capabilities>"
            ),
            url = url,
            layers = layers,
        );
    }

    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<WMS_Capabilities version="1.3.0" xmlns="http://www.opengis.net/wms" xmlns:xlink="http://www.w3.org/1999/xlink">"#,
            "<Service><Name>WMS</Name><Title>Geospatial Web Service</Title>",
            r#"<OnlineResource xlink:href="{url}"/>"#,
            "</Service><Capability><Request>",
            r#"<GetCapabilities><Format>text/xml</Format><DCPType><HTTP><Get><OnlineResource xlink:href="{url}?"/></Get></HTTP></DCPType></GetCapabilities>"#,
            r#"<GetMap><Format>image/png</Format><DCPType><HTTP><Get><OnlineResource xlink:href="{url}?"/></Get></HTTP></DCPType></GetMap>"#,
            r#"<GetFeatureInfo><Format>application/json</Format><DCPType><HTTP><Get><OnlineResource xlink:href="{url}?"/></Get></HTTP></DCPType></GetFeatureInfo>"#,
            "</Request><Exception><Format>XML</Format></Exception>",
            "<Layer><Title>Geospatial Data</Title><CRS>EPSG:4326</CRS><CRS>EPSG:3857</CRS>{layers}</Layer>",
            "</Capability></WMS_Capabilities>"
        ),
        url = url,
        layers = layers,
    )
}

pub fn wms_describe_layer(conf: &Config, layer: &Layer) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<WMS_DescribeLayerResponse version="1.1.1">"#,
            r#"<LayerDescription name="{name}" owsURL="{url}" owsType="WCS">"#,
            r#"<Query typeName="{name}"/>"#,
            "</LayerDescription>",
            "</WMS_DescribeLayerResponse>"
        ),
        name = xml_escape(&layer.name),
        url = ows_url(conf),
    )
}

/// The WCS capabilities document. Dates are trimmed to the first and last
/// entry, which is all the coverage envelope needs.
pub fn wcs_capabilities(conf: &Config, now: DateTime<Utc>) -> String {
    let coverages: String = conf
        .layers
        .iter()
        .map(|layer| {
            let dates = layer.refreshed_dates(now);
            let (first, last) = match (dates.first(), dates.last()) {
                (Some(f), Some(l)) => (f.clone(), l.clone()),
                _ => (String::new(), String::new()),
            };
            format!(
                concat!(
                    "<CoverageOfferingBrief>",
                    "<name>{name}</name><label>{title}</label>",
                    r#"<lonLatEnvelope srsName="urn:ogc:def:crs:OGC:1.3:CRS84">"#,
                    "<gml:pos>-180 -90</gml:pos><gml:pos>180 90</gml:pos>",
                    "<gml:timePosition>{first}</gml:timePosition>",
                    "<gml:timePosition>{last}</gml:timePosition>",
                    "</lonLatEnvelope>",
                    "</CoverageOfferingBrief>"
                ),
                name = xml_escape(&layer.name),
                title = xml_escape(&layer.title),
                first = first,
                last = last,
            )
        })
        .collect();

    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<WCS_Capabilities version="1.0.0" xmlns="http://www.opengis.net/wcs" xmlns:gml="http://www.opengis.net/gml" xmlns:xlink="http://www.w3.org/1999/xlink">"#,
            "<Service><name>WCS</name><label>Geospatial Web Service</label>",
            r#"<OnlineResource xlink:href="{url}"/>"#,
            "</Service><Capability><Request>",
            r#"<GetCapabilities><DCPType><HTTP><Get><OnlineResource xlink:href="{url}?"/></Get></HTTP></DCPType></GetCapabilities>"#,
            r#"<DescribeCoverage><DCPType><HTTP><Get><OnlineResource xlink:href="{url}?"/></Get></HTTP></DCPType></DescribeCoverage>"#,
            r#"<GetCoverage><DCPType><HTTP><Get><OnlineResource xlink:href="{url}?"/></Get></HTTP></DCPType></GetCoverage>"#,
            "</Request></Capability>",
            "<ContentMetadata>{coverages}</ContentMetadata>",
            "</WCS_Capabilities>"
        ),
        url = ows_url(conf),
        coverages = coverages,
    )
}

pub fn wcs_describe_coverage(layer: &Layer, now: DateTime<Utc>) -> String {
    let positions: String = layer
        .refreshed_dates(now)
        .iter()
        .map(|d| format!("<gml:timePosition>{}</gml:timePosition>", d))
        .collect();

    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<CoverageDescription version="1.0.0" xmlns="http://www.opengis.net/wcs" xmlns:gml="http://www.opengis.net/gml">"#,
            "<CoverageOffering>",
            "<name>{name}</name><label>{title}</label><description>{abstract_}</description>",
            r#"<lonLatEnvelope srsName="urn:ogc:def:crs:OGC:1.3:CRS84">"#,
            "<gml:pos>-180 -90</gml:pos><gml:pos>180 90</gml:pos>",
            "</lonLatEnvelope>",
            "<domainSet><temporalDomain>{positions}</temporalDomain></domainSet>",
            "<supportedCRSs><requestResponseCRSs>EPSG:4326</requestResponseCRSs></supportedCRSs>",
            "<supportedFormats><formats>GeoTIFF</formats><formats>NetCDF</formats></supportedFormats>",
            "</CoverageOffering>",
            "</CoverageDescription>"
        ),
        name = xml_escape(&layer.name),
        title = xml_escape(&layer.title),
        abstract_ = xml_escape(&layer.abstract_),
        positions = positions,
    )
}

pub fn wps_capabilities(conf: &Config) -> String {
    let processes: String = conf
        .processes
        .iter()
        .map(|p| {
            format!(
                concat!(
                    "<wps:Process wps:processVersion=\"1.0.0\">",
                    "<ows:Identifier>{id}</ows:Identifier>",
                    "<ows:Title>{title}</ows:Title>",
                    "</wps:Process>"
                ),
                id = xml_escape(&p.identifier),
                title = xml_escape(&p.title),
            )
        })
        .collect();

    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<wps:Capabilities service="WPS" version="1.0.0" xmlns:wps="http://www.opengis.net/wps/1.0.0" xmlns:ows="http://www.opengis.net/ows/1.1">"#,
            "<ows:ServiceIdentification><ows:Title>Geospatial Web Service</ows:Title></ows:ServiceIdentification>",
            "<wps:ProcessOfferings>{processes}</wps:ProcessOfferings>",
            "</wps:Capabilities>"
        ),
        processes = processes,
    )
}

pub fn wps_describe_process(process: &Process) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<wps:ProcessDescriptions service="WPS" version="1.0.0" xmlns:wps="http://www.opengis.net/wps/1.0.0" xmlns:ows="http://www.opengis.net/ows/1.1">"#,
            r#"<ProcessDescription wps:processVersion="1.0.0">"#,
            "<ows:Identifier>{id}</ows:Identifier>",
            "<ows:Title>{title}</ows:Title>",
            "<ows:Abstract>{abstract_}</ows:Abstract>",
            "<DataInputs><Input><ows:Identifier>geometry</ows:Identifier>",
            "<ComplexData><Default><Format><MimeType>application/vnd.geo+json</MimeType></Format></Default></ComplexData>",
            "</Input></DataInputs>",
            "<ProcessOutputs><Output><ows:Identifier>timeseries</ows:Identifier>",
            "<ComplexOutput><Default><Format><MimeType>text/csv</MimeType></Format></Default></ComplexOutput>",
            "</Output></ProcessOutputs>",
            "</ProcessDescription>",
            "</wps:ProcessDescriptions>"
        ),
        id = xml_escape(&process.identifier),
        title = xml_escape(&process.title),
        abstract_ = xml_escape(&process.abstract_),
    )
}

/// The Execute response document embedding the concatenated drill output.
pub fn wps_execute_response(result: &str) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<wps:ExecuteResponse service="WPS" version="1.0.0" xmlns:wps="http://www.opengis.net/wps/1.0.0" xmlns:ows="http://www.opengis.net/ows/1.1">"#,
            "<wps:Status><wps:ProcessSucceeded>Process completed</wps:ProcessSucceeded></wps:Status>",
            "<wps:ProcessOutputs><wps:Output>",
            "<ows:Identifier>timeseries</ows:Identifier>",
            "<wps:Data><wps:ComplexData mimeType=\"text/csv\">{result}</wps:ComplexData></wps:Data>",
            "</wps:Output></wps:ProcessOutputs>",
            "</wps:ExecuteResponse>"
        ),
        result = xml_escape(result),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.service_config.ows_hostname = "maps.example.com".to_string();
        config.service_config.namespace = ".".to_string();
        config.layers.push(Layer {
            name: "L".to_string(),
            title: "Test & Layer".to_string(),
            dates: vec![
                "2020-01-01T00:00:00.000Z".to_string(),
                "2020-01-15T00:00:00.000Z".to_string(),
            ],
            ..Default::default()
        });
        config.processes.push(Process {
            identifier: "P".to_string(),
            title: "Drill".to_string(),
            max_area: 10000.0,
            ..Default::default()
        });
        config
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 6, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_wms_capabilities_versions() {
        let conf = test_config();
        let v13 = wms_capabilities(&conf, "1.3.0", now());
        assert!(v13.contains("<WMS_Capabilities version=\"1.3.0\""));
        assert!(v13.contains("<Name>L</Name>"));
        assert!(v13.contains("Test &amp; Layer"));
        assert!(v13.contains("http://maps.example.com/ows?"));
        assert!(v13.contains("2020-01-01T00:00:00.000Z,2020-01-15T00:00:00.000Z"));

        let v11 = wms_capabilities(&conf, "1.1.1", now());
        assert!(v11.contains("<WMT_MS_Capabilities version=\"1.1.1\""));
    }

    #[test]
    fn test_namespace_in_url() {
        let mut conf = test_config();
        conf.service_config.namespace = "geoglam".to_string();
        let xml = wms_capabilities(&conf, "1.3.0", now());
        assert!(xml.contains("http://maps.example.com/ows/geoglam"));
    }

    #[test]
    fn test_wcs_capabilities_trims_dates() {
        let conf = test_config();
        let xml = wcs_capabilities(&conf, now());
        assert!(xml.contains("<gml:timePosition>2020-01-01T00:00:00.000Z</gml:timePosition>"));
        assert!(xml.contains("<gml:timePosition>2020-01-15T00:00:00.000Z</gml:timePosition>"));
    }

    #[test]
    fn test_wcs_describe_coverage_lists_all_dates() {
        let conf = test_config();
        let xml = wcs_describe_coverage(&conf.layers[0], now());
        assert_eq!(xml.matches("<gml:timePosition>").count(), 2);
        assert!(xml.contains("<formats>GeoTIFF</formats>"));
    }

    #[test]
    fn test_wps_documents() {
        let conf = test_config();
        assert!(wps_capabilities(&conf).contains("<ows:Identifier>P</ows:Identifier>"));
        assert!(wps_describe_process(&conf.processes[0]).contains("<ows:Title>Drill</ows:Title>"));
        let exec = wps_execute_response("2020-01-15T00:00:00.000Z,42.0");
        assert!(exec.contains("ProcessSucceeded"));
        assert!(exec.contains("42.0"));
    }
}
